//! Symbol and line table seam, plus a resolver built from DWARF line programs.

use crate::debugger::arch::{ReturnType, ValueClass};
use crate::debugger::error::Error;
use crate::debugger::CoreAddr;
use crate::weak_error;
use chumsky::error::Rich;
use chumsky::prelude::{any, choice, end, just};
use chumsky::{extra, text, Parser};
use gimli::{AttributeValue, EndianRcSlice, Reader, RunTimeEndian};
use itertools::Itertools;
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionBounds {
    pub name: String,
    pub low: CoreAddr,
    pub high: CoreAddr,
}

impl FunctionBounds {
    pub fn contains(&self, pc: CoreAddr) -> bool {
        pc >= self.low && pc < self.high
    }
}

/// Code range of one source line (`end` is exclusive).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub file: String,
    pub line: u64,
    pub start: CoreAddr,
    pub end: CoreAddr,
}

impl LineRange {
    pub fn location(&self) -> SourceLocation {
        SourceLocation {
            file: self.file.clone(),
            line: self.line,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: String,
    pub line: u64,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Code of an inlined function call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineBlock {
    pub name: String,
    pub low: CoreAddr,
    pub high: CoreAddr,
    /// Source line of the call site.
    pub call_site: Option<SourceLocation>,
}

/// User supplied code location: `*ADDRESS`, `FILE:LINE` or `FUNCTION`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Linespec {
    Address(CoreAddr),
    Line { file: String, line: u64 },
    Function(String),
}

pub type ParseErr<'a> = extra::Err<Rich<'a, char>>;

/// `0x` prefixed hexadecimal number.
pub fn hex<'a>() -> impl Parser<'a, &'a str, u64, ParseErr<'a>> {
    just("0x")
        .or(just("0X"))
        .ignore_then(
            text::digits(16)
                .at_least(1)
                .to_slice()
                .try_map(|s: &str, span| u64::from_str_radix(s, 16).map_err(|e| Rich::custom(span, e))),
        )
        .padded()
        .labelled("hexadecimal number")
}

/// Decimal number of any integer type.
pub fn number<'a, T>() -> impl Parser<'a, &'a str, T, ParseErr<'a>>
where
    T: FromStr,
    T::Err: Display,
{
    text::int(10)
        .try_map(|s: &str, span| s.parse::<T>().map_err(|e| Rich::custom(span, e)))
        .padded()
        .labelled("number")
}

/// Hexadecimal or decimal address.
pub fn address<'a>() -> impl Parser<'a, &'a str, CoreAddr, ParseErr<'a>> {
    choice((hex(), number::<CoreAddr>())).labelled("address")
}

/// `*ADDRESS`, `FILE:LINE` or `FUNCTION`.
pub fn linespec<'a>() -> impl Parser<'a, &'a str, Linespec, ParseErr<'a>> {
    let at_address = just('*')
        .ignore_then(address())
        .map(Linespec::Address);

    let at_line = any()
        .filter(|c: &char| *c != ':' && !c.is_whitespace())
        .repeated()
        .at_least(1)
        .to_slice()
        .then_ignore(just(':'))
        .then(number::<u64>())
        .map(|(file, line): (&str, u64)| Linespec::Line {
            file: file.to_string(),
            line,
        });

    let at_function = text::ascii::ident()
        .separated_by(just("::"))
        .allow_leading()
        .at_least(1)
        .to_slice()
        .map(|name: &str| Linespec::Function(name.to_string()));

    choice((at_address, at_line, at_function))
        .padded()
        .labelled("location")
}

impl FromStr for Linespec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        linespec()
            .then_ignore(end())
            .parse(s)
            .into_result()
            .map_err(|errors| {
                let reason = errors.iter().map(ToString::to_string).join(", ");
                Error::InvalidArgument(format!("invalid location {s:?}: {reason}"))
            })
    }
}

/// Symbol and line lookups the execution control needs.
pub trait LineResolver {
    fn function_at(&self, pc: CoreAddr) -> Option<FunctionBounds>;

    fn line_at(&self, pc: CoreAddr) -> Option<LineRange>;

    fn resolve(&self, spec: &Linespec) -> Option<CoreAddr>;

    /// Innermost inlined call containing the pc.
    fn inline_block_at(&self, _pc: CoreAddr) -> Option<InlineBlock> {
        None
    }

    fn return_type(&self, _function: &FunctionBounds) -> Option<ReturnType> {
        None
    }

    /// Entry of the non-local jump routine, guarded while stepping.
    fn longjmp_target(&self) -> Option<CoreAddr> {
        None
    }
}

/// Resolver for targets without symbols.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl LineResolver for NoSymbols {
    fn function_at(&self, _: CoreAddr) -> Option<FunctionBounds> {
        None
    }

    fn line_at(&self, _: CoreAddr) -> Option<LineRange> {
        None
    }

    fn resolve(&self, spec: &Linespec) -> Option<CoreAddr> {
        match spec {
            Linespec::Address(addr) => Some(*addr),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct LineRow {
    addr: CoreAddr,
    file: Rc<str>,
    line: u64,
    /// Row ends a sequence, it has no code.
    end: bool,
}

#[derive(Clone, Debug)]
struct FunctionDie {
    bounds: FunctionBounds,
    ret: Option<ReturnType>,
}

const LONGJMP_NAMES: &[&str] = &["longjmp", "_longjmp", "siglongjmp", "__longjmp_chk"];

type R = EndianRcSlice<RunTimeEndian>;

/// Resolver over the symbol table and the DWARF info of an object file.
#[derive(Default)]
pub struct DwarfSymbols {
    functions: Vec<FunctionBounds>,
    dies: Vec<FunctionDie>,
    inlines: Vec<InlineBlock>,
    rows: Vec<LineRow>,
    symbols: HashMap<String, CoreAddr>,
}

impl DwarfSymbols {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        // SAFETY: file is opened read-only and only read through the map
        let mmap = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)?;
        let mut symbols = Self::default();
        symbols.load_symbol_table(&obj);
        symbols.load_dwarf(&obj)?;
        symbols.finish();
        Ok(symbols)
    }

    /// Relocate all addresses by `bias` (position independent executables).
    pub fn with_load_bias(mut self, bias: CoreAddr) -> Self {
        self.functions.iter_mut().for_each(|f| {
            f.low += bias;
            f.high += bias;
        });
        self.dies.iter_mut().for_each(|d| {
            d.bounds.low += bias;
            d.bounds.high += bias;
        });
        self.inlines.iter_mut().for_each(|b| {
            b.low += bias;
            b.high += bias;
        });
        self.rows.iter_mut().for_each(|r| r.addr += bias);
        self.symbols.values_mut().for_each(|a| *a += bias);
        self
    }

    fn load_symbol_table(&mut self, obj: &object::File) {
        for sym in obj.symbols() {
            if sym.kind() != SymbolKind::Text || sym.address() == 0 {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            self.symbols.insert(name.to_string(), sym.address());
            if sym.size() > 0 {
                self.functions.push(FunctionBounds {
                    name: name.to_string(),
                    low: sym.address(),
                    high: sym.address() + sym.size(),
                });
            }
        }
    }

    fn load_dwarf(&mut self, obj: &object::File) -> Result<(), Error> {
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> Result<R, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|s| s.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            weak_error!(self.load_lines(&dwarf, &unit), "line program:");
            weak_error!(self.load_dies(&dwarf, &unit), "debug info entries:");
        }
        Ok(())
    }

    fn load_lines(&mut self, dwarf: &gimli::Dwarf<R>, unit: &gimli::Unit<R>) -> Result<(), Error> {
        let Some(program) = unit.line_program.clone() else {
            return Ok(());
        };
        let mut files: HashMap<u64, Rc<str>> = HashMap::new();
        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            let file_idx = row.file_index();
            let file = match files.get(&file_idx) {
                Some(f) => f.clone(),
                None => {
                    let name: Rc<str> = match header.file(file_idx) {
                        Some(entry) => {
                            let name = dwarf.attr_string(unit, entry.path_name())?;
                            Rc::from(name.to_string_lossy()?.as_ref())
                        }
                        None => Rc::from("??"),
                    };
                    files.insert(file_idx, name.clone());
                    name
                }
            };
            self.rows.push(LineRow {
                addr: row.address(),
                file,
                line: row.line().map(|l| l.get()).unwrap_or(0),
                end: row.end_sequence(),
            });
        }
        Ok(())
    }

    fn load_dies(&mut self, dwarf: &gimli::Dwarf<R>, unit: &gimli::Unit<R>) -> Result<(), Error> {
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            match entry.tag() {
                gimli::DW_TAG_subprogram => {
                    let Some((low, high)) = die_pc_range(dwarf, unit, entry)? else {
                        continue;
                    };
                    let name = die_name(dwarf, unit, entry)?.unwrap_or_else(|| "??".to_string());
                    let ret = match entry.attr_value(gimli::DW_AT_type)? {
                        Some(AttributeValue::UnitRef(offset)) => {
                            die_type(dwarf, unit, offset, 0)?
                        }
                        _ => Some(ReturnType::void()),
                    };
                    self.dies.push(FunctionDie {
                        bounds: FunctionBounds { name, low, high },
                        ret,
                    });
                }
                gimli::DW_TAG_inlined_subroutine => {
                    let Some((low, high)) = die_pc_range(dwarf, unit, entry)? else {
                        continue;
                    };
                    let name = match entry.attr_value(gimli::DW_AT_abstract_origin)? {
                        Some(AttributeValue::UnitRef(offset)) => {
                            let origin = unit.entry(offset)?;
                            die_name(dwarf, unit, &origin)?
                        }
                        _ => None,
                    };
                    let call_line = match entry.attr_value(gimli::DW_AT_call_line)? {
                        Some(AttributeValue::Udata(line)) => Some(line),
                        Some(AttributeValue::Data1(line)) => Some(line as u64),
                        Some(AttributeValue::Data2(line)) => Some(line as u64),
                        Some(AttributeValue::Data4(line)) => Some(line as u64),
                        _ => None,
                    };
                    self.inlines.push(InlineBlock {
                        name: name.unwrap_or_else(|| "<inlined>".to_string()),
                        low,
                        high,
                        call_site: call_line.map(|line| SourceLocation {
                            file: String::new(),
                            line,
                        }),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.functions.sort_by_key(|f| f.low);
        self.functions.dedup_by_key(|f| f.low);
        self.dies.sort_by_key(|d| d.bounds.low);
        // innermost (shortest) blocks first for the same start
        self.inlines
            .sort_by_key(|b| (b.low, std::cmp::Reverse(b.high)));

        self.rows.sort_by_key(|r| (r.addr, !r.end));
        // consecutive rows of the same line form a single range
        self.rows = std::mem::take(&mut self.rows)
            .into_iter()
            .coalesce(|prev, next| {
                if !prev.end && !next.end && prev.line == next.line && prev.file == next.file {
                    Ok(prev)
                } else {
                    Err((prev, next))
                }
            })
            .collect();
    }

    fn call_site_file(&self, block: &InlineBlock) -> Option<String> {
        self.line_at(block.low.saturating_sub(1)).map(|l| l.file)
    }
}

fn die_name(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<Option<String>, Error> {
    match entry.attr_value(gimli::DW_AT_name)? {
        Some(value) => {
            let name = dwarf.attr_string(unit, value)?;
            let name = name.to_string_lossy()?.into_owned();
            Ok(Some(name))
        }
        None => Ok(None),
    }
}

fn die_address(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    value: AttributeValue<R>,
) -> Result<Option<CoreAddr>, Error> {
    Ok(match value {
        AttributeValue::Addr(addr) => Some(addr),
        AttributeValue::DebugAddrIndex(index) => Some(dwarf.address(unit, index)?),
        _ => None,
    })
}

fn die_pc_range(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<Option<(CoreAddr, CoreAddr)>, Error> {
    let Some(low) = entry.attr_value(gimli::DW_AT_low_pc)? else {
        return Ok(None);
    };
    let Some(low) = die_address(dwarf, unit, low)? else {
        return Ok(None);
    };
    let high = match entry.attr_value(gimli::DW_AT_high_pc)? {
        Some(AttributeValue::Udata(len)) => low + len,
        Some(AttributeValue::Data1(len)) => low + len as u64,
        Some(AttributeValue::Data2(len)) => low + len as u64,
        Some(AttributeValue::Data4(len)) => low + len as u64,
        Some(AttributeValue::Data8(len)) => low + len,
        Some(value) => match die_address(dwarf, unit, value)? {
            Some(high) => high,
            None => return Ok(None),
        },
        None => return Ok(None),
    };
    Ok((low != 0 && high > low).then_some((low, high)))
}

fn die_type(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    offset: gimli::UnitOffset<usize>,
    depth: u32,
) -> Result<Option<ReturnType>, Error> {
    if depth > 8 {
        return Ok(None);
    }
    let entry = unit.entry(offset)?;
    let name = die_name(dwarf, unit, &entry)?.unwrap_or_default();
    let size = match entry.attr_value(gimli::DW_AT_byte_size)? {
        Some(value) => value.udata_value().unwrap_or(0) as usize,
        None => 0,
    };
    let class = match entry.tag() {
        gimli::DW_TAG_base_type => match entry.attr_value(gimli::DW_AT_encoding)? {
            Some(AttributeValue::Encoding(gimli::DW_ATE_float)) => ValueClass::Float,
            _ => ValueClass::Integer,
        },
        gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
            return Ok(Some(ReturnType {
                name,
                size: if size == 0 { 8 } else { size },
                class: ValueClass::Pointer,
            }))
        }
        gimli::DW_TAG_enumeration_type => ValueClass::Integer,
        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type | gimli::DW_TAG_class_type => {
            ValueClass::Aggregate
        }
        gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
            return match entry.attr_value(gimli::DW_AT_type)? {
                Some(AttributeValue::UnitRef(inner)) => die_type(dwarf, unit, inner, depth + 1),
                _ => Ok(Some(ReturnType::void())),
            };
        }
        _ => return Ok(None),
    };
    Ok(Some(ReturnType { name, size, class }))
}

impl LineResolver for DwarfSymbols {
    fn function_at(&self, pc: CoreAddr) -> Option<FunctionBounds> {
        let idx = self.dies.partition_point(|d| d.bounds.low <= pc);
        if let Some(die) = self.dies[..idx].iter().rev().find(|d| d.bounds.contains(pc)) {
            return Some(die.bounds.clone());
        }
        let idx = self.functions.partition_point(|f| f.low <= pc);
        self.functions[..idx]
            .last()
            .filter(|f| f.contains(pc))
            .cloned()
    }

    fn line_at(&self, pc: CoreAddr) -> Option<LineRange> {
        let idx = self.rows.partition_point(|r| r.addr <= pc);
        let row = self.rows[..idx].last()?;
        if row.end || row.line == 0 {
            return None;
        }
        let end = self.rows.get(idx).map(|r| r.addr)?;
        Some(LineRange {
            file: row.file.to_string(),
            line: row.line,
            start: row.addr,
            end,
        })
    }

    fn resolve(&self, spec: &Linespec) -> Option<CoreAddr> {
        match spec {
            Linespec::Address(addr) => Some(*addr),
            Linespec::Function(name) => self
                .dies
                .iter()
                .find(|d| &d.bounds.name == name)
                .map(|d| d.bounds.low)
                .or_else(|| self.symbols.get(name).copied()),
            Linespec::Line { file, line } => self
                .rows
                .iter()
                .filter(|r| !r.end && r.line == *line && r.file.ends_with(file.as_str()))
                .map(|r| r.addr)
                .min(),
        }
    }

    fn inline_block_at(&self, pc: CoreAddr) -> Option<InlineBlock> {
        self.inlines
            .iter()
            .filter(|b| pc >= b.low && pc < b.high)
            .min_by_key(|b| b.high - b.low)
            .map(|b| {
                let mut block = b.clone();
                if let (Some(site), Some(file)) = (block.call_site.as_mut(), self.call_site_file(b))
                {
                    site.file = file;
                }
                block
            })
    }

    fn return_type(&self, function: &FunctionBounds) -> Option<ReturnType> {
        self.dies
            .iter()
            .find(|d| d.bounds.low == function.low)
            .and_then(|d| d.ret.clone())
    }

    fn longjmp_target(&self) -> Option<CoreAddr> {
        LONGJMP_NAMES
            .iter()
            .find_map(|name| self.symbols.get(*name).copied())
    }
}
