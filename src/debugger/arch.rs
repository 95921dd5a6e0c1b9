//! Architecture accessor and unwinder seams.

use crate::debugger::error::Error;
use crate::debugger::register::RegisterCache;
use crate::debugger::symbols::{FunctionBounds, LineResolver};
use crate::debugger::target::TargetMemory;
use crate::debugger::CoreAddr;
use strum_macros::Display;

/// Identity of a stack frame, stable while the frame exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId {
    /// Canonical frame address.
    pub stack: CoreAddr,
    /// Start of the frame function (or the pc if unknown).
    pub code: CoreAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum FrameKind {
    Normal,
    /// Virtual frame of an inlined function call.
    Inline,
    /// Frame of a function that was called through a tail jump, its caller frame is gone.
    TailCall,
    SigTramp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub level: usize,
    pub pc: CoreAddr,
    pub id: FrameId,
    pub kind: FrameKind,
    /// False if no breakpoint can be placed in frame code.
    pub writable: bool,
    pub function: Option<FunctionBounds>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ValueClass {
    Void,
    Integer,
    Pointer,
    Float,
    Aggregate,
}

/// Function return type as known by the symbol resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnType {
    pub name: String,
    pub size: usize,
    pub class: ValueClass,
}

impl ReturnType {
    pub fn void() -> Self {
        Self {
            name: "void".to_string(),
            size: 0,
            class: ValueClass::Void,
        }
    }
}

/// Value returned by a finished function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnValue {
    pub ty: ReturnType,
    pub bytes: Vec<u8>,
}

impl ReturnValue {
    /// Value as unsigned little-endian integer, if it fits.
    pub fn as_u64(&self) -> Option<u64> {
        if self.bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(u64::from_le_bytes(buf))
    }
}

/// Effect of an instruction that is about to execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordEffect {
    Register(String),
    Memory { addr: CoreAddr, len: usize },
}

pub trait Arch {
    fn name(&self) -> &'static str;

    fn register_names(&self) -> &'static [&'static str];

    fn pc_register(&self) -> &'static str;

    fn sp_register(&self) -> &'static str;

    fn breakpoint_instruction(&self) -> &'static [u8];

    /// Value by which the pc is ahead of the breakpoint address after a breakpoint trap.
    fn decr_pc_after_break(&self) -> u64 {
        0
    }

    /// Extract the return value of a just finished function. `None` for void functions.
    fn return_value(&self, regs: &RegisterCache, ty: &ReturnType)
        -> Result<Option<Vec<u8>>, Error>;

    /// List registers and memory changed by the instruction at the current pc.
    fn process_record(
        &self,
        _regs: &RegisterCache,
        _mem: &mut dyn TargetMemory,
    ) -> Result<Vec<RecordEffect>, Error> {
        Err(Error::Unsupported("process record on this architecture"))
    }
}

pub struct UnwindContext<'a> {
    pub regs: &'a RegisterCache,
    pub mem: &'a mut dyn TargetMemory,
    pub symbols: &'a dyn LineResolver,
    pub arch: &'a dyn Arch,
    pub max_frames: usize,
}

/// Builds the physical frame chain of an execution unit, innermost first.
pub trait Unwinder {
    fn unwind(&self, ctx: UnwindContext<'_>) -> Result<Vec<FrameInfo>, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64;

const X86_64_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "eflags", "cs", "orig_rax", "fs_base", "gs_base", "fs", "gs",
    "ss", "ds", "es",
];

impl Arch for X86_64 {
    fn name(&self) -> &'static str {
        "i386:x86-64"
    }

    fn register_names(&self) -> &'static [&'static str] {
        X86_64_REGISTERS
    }

    fn pc_register(&self) -> &'static str {
        "rip"
    }

    fn sp_register(&self) -> &'static str {
        "rsp"
    }

    fn breakpoint_instruction(&self) -> &'static [u8] {
        &[0xCC]
    }

    fn decr_pc_after_break(&self) -> u64 {
        1
    }

    fn return_value(
        &self,
        regs: &RegisterCache,
        ty: &ReturnType,
    ) -> Result<Option<Vec<u8>>, Error> {
        let reg = |name: &str| {
            regs.get_u64(name)
                .ok_or_else(|| Error::RegisterUnavailable(name.to_string()))
        };
        match ty.class {
            ValueClass::Void => Ok(None),
            ValueClass::Integer | ValueClass::Pointer if ty.size <= 8 => {
                Ok(Some(reg("rax")?.to_le_bytes()[..ty.size].to_vec()))
            }
            ValueClass::Integer | ValueClass::Aggregate if ty.size <= 16 => {
                let mut bytes = reg("rax")?.to_le_bytes().to_vec();
                bytes.extend_from_slice(&reg("rdx")?.to_le_bytes());
                bytes.truncate(ty.size);
                Ok(Some(bytes))
            }
            _ => Err(Error::Unsupported(
                "return values of this type on x86-64 (memory or vector registers)",
            )),
        }
    }
}

/// Unwinder that follows saved frame pointers (`push rbp; mov rbp, rsp` prologues).
#[derive(Debug, Clone, Copy)]
pub struct FramePointerUnwinder {
    pub fp_register: &'static str,
    pub word_size: u64,
}

impl FramePointerUnwinder {
    pub fn x86_64() -> Self {
        Self {
            fp_register: "rbp",
            word_size: 8,
        }
    }
}

impl Unwinder for FramePointerUnwinder {
    fn unwind(&self, ctx: UnwindContext<'_>) -> Result<Vec<FrameInfo>, Error> {
        let pc_name = ctx.arch.pc_register();
        let mut pc = ctx
            .regs
            .get_u64(pc_name)
            .ok_or_else(|| Error::RegisterUnavailable(pc_name.to_string()))?;
        let mut fp = ctx
            .regs
            .get_u64(self.fp_register)
            .ok_or_else(|| Error::RegisterUnavailable(self.fp_register.to_string()))?;

        let mut frames = vec![];
        while frames.len() < ctx.max_frames {
            let function = ctx.symbols.function_at(pc);
            let cfa = fp + 2 * self.word_size;
            frames.push(FrameInfo {
                level: frames.len(),
                pc,
                id: FrameId {
                    stack: cfa,
                    code: function.as_ref().map(|f| f.low).unwrap_or(pc),
                },
                kind: FrameKind::Normal,
                writable: true,
                function,
            });

            if fp == 0 {
                break;
            }
            let Ok(ret_addr) = ctx.mem.read_u64(fp + self.word_size) else {
                break;
            };
            let Ok(prev_fp) = ctx.mem.read_u64(fp) else {
                break;
            };
            if ret_addr == 0 || (prev_fp != 0 && prev_fp <= fp) {
                break;
            }
            pc = ret_addr;
            fp = prev_fp;
        }
        Ok(frames)
    }
}
