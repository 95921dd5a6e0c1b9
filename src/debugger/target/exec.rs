use crate::debugger::error::{Error, TransferError};
use crate::debugger::target::{
    Beneath, SectionData, Stratum, Target, TargetObject, TargetSection, Transfer, TransferRequest,
};
use crate::debugger::CoreAddr;
use crate::sd_debug;
use memmap2::Mmap;
use object::elf::{PT_LOAD, SHF_ALLOC};
use object::read::elf::{ElfFile64, ProgramHeader};
use object::{Endianness, Object, ObjectSection, SectionFlags, SectionKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Executable file layer: sections of the program image, readable before the program runs.
pub struct ExecTarget {
    path: PathBuf,
    sections: Vec<TargetSection>,
    entry: CoreAddr,
}

/// Load address of an allocated section: physical address of the segment that carries it.
fn section_lma(segments: &[(u64, u64, u64)], file_offset: u64, addr: CoreAddr) -> CoreAddr {
    segments
        .iter()
        .find(|(offset, filesz, _)| file_offset >= *offset && file_offset < offset + filesz)
        .map(|(offset, _, paddr)| paddr + (file_offset - offset))
        .unwrap_or(addr)
}

impl ExecTarget {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = Rc::new(unsafe { Mmap::map(&file)? });
        let obj = object::File::parse(&**mmap)?;

        // (p_offset, p_filesz, p_paddr) of loadable segments
        let segments: Vec<(u64, u64, u64)> = match ElfFile64::<Endianness>::parse(&**mmap) {
            Ok(elf) => {
                let endian = elf.endian();
                elf.raw_segments()
                    .iter()
                    .filter(|ph| ph.p_type(endian) == PT_LOAD)
                    .map(|ph| {
                        (
                            ph.p_offset(endian),
                            ph.p_filesz(endian),
                            ph.p_paddr(endian),
                        )
                    })
                    .collect()
            }
            Err(_) => vec![],
        };

        let mut sections = vec![];
        for section in obj.sections() {
            let allocated = match section.flags() {
                SectionFlags::Elf { sh_flags } => sh_flags & SHF_ALLOC as u64 != 0,
                _ => section.address() != 0,
            };
            if !allocated || section.size() == 0 {
                continue;
            }
            let name = section.name().unwrap_or("?").to_string();
            let addr = section.address();
            let kind = section.kind();
            let readonly = matches!(
                kind,
                SectionKind::Text
                    | SectionKind::ReadOnlyData
                    | SectionKind::ReadOnlyDataWithRel
                    | SectionKind::ReadOnlyString
            );
            let (data, lma) = match section.file_range() {
                Some((offset, _))
                    if !matches!(
                        kind,
                        SectionKind::UninitializedData | SectionKind::UninitializedTls
                    ) =>
                {
                    (
                        SectionData::File {
                            map: mmap.clone(),
                            offset: offset as usize,
                        },
                        section_lma(&segments, offset, addr),
                    )
                }
                _ => (SectionData::Zeroed, addr),
            };
            sections.push(TargetSection {
                name,
                addr,
                endaddr: addr + section.size(),
                lma,
                readonly,
                overlay: lma != addr,
                data,
            });
        }
        sd_debug!(
            target: "target",
            "exec file {}: {} sections",
            path.display(),
            sections.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            sections,
            entry: obj.entry(),
        })
    }

    pub fn entry(&self) -> CoreAddr {
        self.entry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sections(&self) -> &[TargetSection] {
        &self.sections
    }
}

impl Target for ExecTarget {
    fn shortname(&self) -> &'static str {
        "exec"
    }

    fn longname(&self) -> String {
        format!("Local exec file: {}", self.path.display())
    }

    fn stratum(&self) -> Stratum {
        Stratum::File
    }

    fn xfer_partial(
        &mut self,
        _: Beneath<'_>,
        _: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        if req.is_empty() {
            return Ok(Transfer::Eof);
        }
        let Some(section) = self
            .sections
            .iter()
            .find(|s| !s.overlay && s.contains(offset))
        else {
            return Ok(Transfer::Io(TransferError::Inaccessible(offset)));
        };
        match req {
            TransferRequest::Read(buf) => Ok(Transfer::done(section.read(offset - section.addr, buf))),
            TransferRequest::Write(_) => Ok(Transfer::Io(TransferError::NotWritable(offset))),
        }
    }

    fn has_memory(&self, _: Beneath<'_>) -> bool {
        true
    }

    fn section_table(&self, _: Beneath<'_>) -> Vec<TargetSection> {
        self.sections.clone()
    }
}
