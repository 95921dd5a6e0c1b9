//! Layered backend stack.
//!
//! A debuggee is controlled through an ordered set of layers (see [`Stratum`]). Every operation
//! enters the stack at the top layer, a layer that has nothing to add to an operation forwards it
//! to the nearest occupied stratum below, resolved at the moment of the call (see [`Beneath`]).

pub mod dummy;
pub mod exec;
#[cfg(target_os = "linux")]
pub mod native;
pub mod record;
pub mod stack;

pub use dummy::DummyTarget;
pub use stack::{LayerInfo, TargetRef, TargetStack};

use crate::debugger::error::{Error, TransferError};
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::CoreAddr;
use memmap2::Mmap;
use nix::sys::signal::Signal;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroUsize;
use std::path::Path;
use std::rc::Rc;
use strum_macros::{Display, EnumIter};

/// Rank of a layer in the stack. At most one layer occupies a stratum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Stratum {
    Dummy,
    File,
    Process,
    Thread,
    Record,
    Debug,
}

impl Stratum {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Kind of the object addressed by a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TargetObject {
    /// Program memory as the user sees it: breakpoint instructions are hidden.
    Memory,
    /// Program memory as it is, breakpoint instructions included.
    RawMemory,
    /// Memory known to belong to a stack, cached if `stack_cache` is set.
    StackMemory,
    /// Memory known to contain code, cached if `code_cache` is set.
    CodeMemory,
}

impl TargetObject {
    /// True if breakpoint shadows apply to this object.
    pub fn shadowed(self) -> bool {
        self != TargetObject::RawMemory
    }
}

/// Direction and buffer of a single transfer.
pub enum TransferRequest<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<'a> TransferRequest<'a> {
    pub fn len(&self) -> usize {
        match self {
            TransferRequest::Read(buf) => buf.len(),
            TransferRequest::Write(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_write(&self) -> bool {
        matches!(self, TransferRequest::Write(_))
    }

    /// Reborrow the request with its length limited to `len`.
    pub fn reborrow(&mut self, len: usize) -> TransferRequest<'_> {
        match self {
            TransferRequest::Read(buf) => {
                let len = len.min(buf.len());
                TransferRequest::Read(&mut buf[..len])
            }
            TransferRequest::Write(data) => {
                let len = len.min(data.len());
                TransferRequest::Write(&data[..len])
            }
        }
    }
}

/// Result of a single partial transfer.
///
/// A successful transfer always moves at least one byte, zero length success is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Part of the request (from its beginning) is done.
    Done(NonZeroUsize),
    /// Nothing more to transfer, only valid for zero length requests.
    Eof,
    /// Data exists but can't be obtained now (e.g. not collected in a trace).
    Unavailable,
    /// This layer failed, lower layers may succeed.
    Io(TransferError),
}

impl Transfer {
    /// Construct success result. Zero length is a contract violation and turns into an error.
    pub fn done(len: usize) -> Self {
        match NonZeroUsize::new(len) {
            Some(n) => Transfer::Done(n),
            None => Transfer::Io(TransferError::ZeroLength),
        }
    }

    pub fn transferred(&self) -> usize {
        match self {
            Transfer::Done(n) => n.get(),
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ExecDirection {
    Forward,
    Reverse,
}

/// Resume request handed down the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRequest {
    /// Set of units to resume, an exact unit, a whole process or [`Ptid::ANY`].
    pub scope: Ptid,
    /// Unit that receives the signal and performs the step.
    pub thread: Ptid,
    pub step: bool,
    pub signal: Option<Signal>,
    pub direction: ExecDirection,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Return `None` instead of blocking if no unit has stopped yet.
    pub nohang: bool,
}

/// State change of an execution unit observed by `wait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Stopped(Signal),
    Exited(i32),
    Signalled(Signal),
    /// Replay reached an end of the execution history.
    NoHistory,
    ThreadExited,
    /// Nothing interesting happened, the unit must be resumed as before.
    Spurious,
}

/// Software breakpoint location given to backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointSite {
    pub addr: CoreAddr,
    /// Architecture breakpoint instruction.
    pub insn: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointInsertion {
    /// Layer handled the breakpoint itself, `shadow` holds the original bytes.
    Handled { shadow: Vec<u8> },
    /// Nobody handles breakpoints, the caller must patch memory.
    UseMemory,
}

/// Contents of an executable section.
#[derive(Clone)]
pub enum SectionData {
    File { map: Rc<Mmap>, offset: usize },
    Bytes(Rc<[u8]>),
    /// Allocated but not stored in the file (`.bss`).
    Zeroed,
}

impl Debug for SectionData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SectionData::File { offset, .. } => write!(f, "File(offset: {offset:#x})"),
            SectionData::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            SectionData::Zeroed => f.write_str("Zeroed"),
        }
    }
}

/// Section of an executable image mapped into the debuggee address space.
#[derive(Clone, Debug)]
pub struct TargetSection {
    pub name: String,
    /// Virtual (run-time) address.
    pub addr: CoreAddr,
    pub endaddr: CoreAddr,
    /// Load address, differs from `addr` for overlay sections.
    pub lma: CoreAddr,
    pub readonly: bool,
    pub overlay: bool,
    pub data: SectionData,
}

impl TargetSection {
    pub fn size(&self) -> u64 {
        self.endaddr - self.addr
    }

    pub fn contains(&self, addr: CoreAddr) -> bool {
        addr >= self.addr && addr < self.endaddr
    }

    pub fn contains_lma(&self, addr: CoreAddr) -> bool {
        addr >= self.lma && addr < self.lma + self.size()
    }

    /// Copy section bytes starting at `offset` (from section start) into `buf`,
    /// return the number of copied bytes.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        if offset >= self.size() {
            return 0;
        }
        let len = buf.len().min((self.size() - offset) as usize);
        match &self.data {
            SectionData::File { map, offset: file_offset } => {
                let start = file_offset + offset as usize;
                let avail = map.len().saturating_sub(start).min(len);
                buf[..avail].copy_from_slice(&map[start..start + avail]);
                buf[avail..len].fill(0);
            }
            SectionData::Bytes(bytes) => {
                let start = offset as usize;
                let avail = bytes.len().saturating_sub(start).min(len);
                buf[..avail].copy_from_slice(&bytes[start..start + avail]);
                buf[avail..len].fill(0);
            }
            SectionData::Zeroed => buf[..len].fill(0),
        }
        len
    }
}

/// Backend layer capabilities.
///
/// Every operation receives the [`Beneath`] handle of the layer and by default forwards the call
/// there, so a layer only overrides what it actually implements.
pub trait Target {
    fn shortname(&self) -> &'static str;

    fn longname(&self) -> String {
        self.shortname().to_string()
    }

    fn stratum(&self) -> Stratum;

    /// Release layer resources. Called once, when the last stack drops the layer.
    fn close(&mut self) {}

    fn xfer_partial(
        &mut self,
        beneath: Beneath<'_>,
        object: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        beneath.xfer_partial(object, offset, req)
    }

    /// Layer covers the whole address space, raw memory search never goes below it.
    fn has_all_memory(&self) -> bool {
        false
    }

    fn has_memory(&self, beneath: Beneath<'_>) -> bool {
        beneath.has_memory()
    }

    fn has_execution(&self, beneath: Beneath<'_>) -> bool {
        beneath.has_execution()
    }

    fn section_table(&self, beneath: Beneath<'_>) -> Vec<TargetSection> {
        beneath.section_table()
    }

    fn fetch_registers(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        regs: &mut RegisterCache,
    ) -> Result<(), Error> {
        beneath.fetch_registers(ptid, regs)
    }

    fn store_registers(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        beneath.store_registers(ptid, regs)
    }

    /// Hand the request over, actual stop is observed by a later `wait`.
    fn resume(&mut self, beneath: Beneath<'_>, req: ResumeRequest) -> Result<(), Error> {
        beneath.resume(req)
    }

    fn wait(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        beneath.wait(ptid, opts)
    }

    fn stop(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<(), Error> {
        beneath.stop(ptid)
    }

    fn create_inferior(
        &mut self,
        beneath: Beneath<'_>,
        program: &Path,
        args: &[String],
    ) -> Result<Ptid, Error> {
        beneath.create_inferior(program, args)
    }

    fn attach(&mut self, beneath: Beneath<'_>, pid: i32) -> Result<Ptid, Error> {
        beneath.attach(pid)
    }

    fn detach(&mut self, beneath: Beneath<'_>, pid: i32) -> Result<(), Error> {
        beneath.detach(pid)
    }

    fn kill(&mut self, beneath: Beneath<'_>, pid: i32) -> Result<(), Error> {
        beneath.kill(pid)
    }

    /// Forget a process that is gone.
    fn mourn_inferior(&mut self, beneath: Beneath<'_>, pid: i32) {
        beneath.mourn_inferior(pid)
    }

    fn thread_alive(&self, beneath: Beneath<'_>, ptid: Ptid) -> bool {
        beneath.thread_alive(ptid)
    }

    /// Append identities of all live units to `list`.
    fn update_thread_list(
        &mut self,
        beneath: Beneath<'_>,
        list: &mut Vec<Ptid>,
    ) -> Result<(), Error> {
        beneath.update_thread_list(list)
    }

    fn pid_to_str(&self, beneath: Beneath<'_>, ptid: Ptid) -> String {
        beneath.pid_to_str(ptid)
    }

    fn insert_breakpoint(
        &mut self,
        beneath: Beneath<'_>,
        site: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        beneath.insert_breakpoint(site)
    }

    fn remove_breakpoint(
        &mut self,
        beneath: Beneath<'_>,
        site: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        beneath.remove_breakpoint(site)
    }

    /// True if the last stop of the unit was caused by a software breakpoint.
    fn stopped_by_sw_breakpoint(&self, beneath: Beneath<'_>, ptid: Ptid) -> bool {
        beneath.stopped_by_sw_breakpoint(ptid)
    }

    fn can_execute_reverse(&self, beneath: Beneath<'_>) -> bool {
        beneath.can_execute_reverse()
    }

    /// True if the layer shows a past state of the program instead of the live one.
    fn is_replaying(&self, beneath: Beneath<'_>) -> bool {
        beneath.is_replaying()
    }

    /// Return an opaque token describing the current execution point.
    fn get_bookmark(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<Vec<u8>, Error> {
        beneath.get_bookmark(ptid)
    }

    fn goto_bookmark(
        &mut self,
        beneath: Beneath<'_>,
        token: &[u8],
        ptid: Ptid,
    ) -> Result<(), Error> {
        beneath.goto_bookmark(token, ptid)
    }
}

/// Handle to the part of a stack below some stratum.
///
/// The next layer is looked up on each call, so a handle always observes the current stack.
#[derive(Clone, Copy)]
pub struct Beneath<'a> {
    stack: &'a TargetStack,
    below: usize,
}

macro_rules! forward {
    ($self: ident, $borrow: ident, $method: ident ( $($arg: expr),* )) => {
        match $self.next() {
            Some((idx, layer)) => layer.cell().$borrow().$method(
                Beneath { stack: $self.stack, below: idx },
                $($arg),*
            ),
            None => DummyTarget.$method(Beneath { stack: $self.stack, below: 0 }, $($arg),*),
        }
    };
}

impl<'a> Beneath<'a> {
    pub(super) fn new(stack: &'a TargetStack, below: usize) -> Self {
        Self { stack, below }
    }

    /// Nearest occupied stratum below this handle.
    fn next(&self) -> Option<(usize, &'a TargetRef)> {
        (0..self.below)
            .rev()
            .find_map(|idx| self.stack.slot(idx).map(|layer| (idx, layer)))
    }

    /// Stratum of the layer an operation would be forwarded to.
    pub fn next_stratum(&self) -> Option<Stratum> {
        self.next().map(|(_, layer)| layer.stratum())
    }

    pub fn xfer_partial(
        self,
        object: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        forward!(self, borrow_mut, xfer_partial(object, offset, req))
    }

    pub fn has_memory(self) -> bool {
        forward!(self, borrow, has_memory())
    }

    pub fn has_execution(self) -> bool {
        forward!(self, borrow, has_execution())
    }

    pub fn section_table(self) -> Vec<TargetSection> {
        forward!(self, borrow, section_table())
    }

    pub fn fetch_registers(self, ptid: Ptid, regs: &mut RegisterCache) -> Result<(), Error> {
        forward!(self, borrow_mut, fetch_registers(ptid, regs))
    }

    pub fn store_registers(self, ptid: Ptid, regs: &RegisterCache) -> Result<(), Error> {
        forward!(self, borrow_mut, store_registers(ptid, regs))
    }

    pub fn resume(self, req: ResumeRequest) -> Result<(), Error> {
        forward!(self, borrow_mut, resume(req))
    }

    pub fn wait(
        self,
        ptid: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        forward!(self, borrow_mut, wait(ptid, opts))
    }

    pub fn stop(self, ptid: Ptid) -> Result<(), Error> {
        forward!(self, borrow_mut, stop(ptid))
    }

    pub fn create_inferior(self, program: &Path, args: &[String]) -> Result<Ptid, Error> {
        forward!(self, borrow_mut, create_inferior(program, args))
    }

    pub fn attach(self, pid: i32) -> Result<Ptid, Error> {
        forward!(self, borrow_mut, attach(pid))
    }

    pub fn detach(self, pid: i32) -> Result<(), Error> {
        forward!(self, borrow_mut, detach(pid))
    }

    pub fn kill(self, pid: i32) -> Result<(), Error> {
        forward!(self, borrow_mut, kill(pid))
    }

    pub fn mourn_inferior(self, pid: i32) {
        forward!(self, borrow_mut, mourn_inferior(pid))
    }

    pub fn thread_alive(self, ptid: Ptid) -> bool {
        forward!(self, borrow, thread_alive(ptid))
    }

    pub fn update_thread_list(self, list: &mut Vec<Ptid>) -> Result<(), Error> {
        forward!(self, borrow_mut, update_thread_list(list))
    }

    pub fn pid_to_str(self, ptid: Ptid) -> String {
        forward!(self, borrow, pid_to_str(ptid))
    }

    pub fn insert_breakpoint(self, site: &BreakpointSite) -> Result<BreakpointInsertion, Error> {
        forward!(self, borrow_mut, insert_breakpoint(site))
    }

    pub fn remove_breakpoint(self, site: &BreakpointSite) -> Result<BreakpointInsertion, Error> {
        forward!(self, borrow_mut, remove_breakpoint(site))
    }

    pub fn stopped_by_sw_breakpoint(self, ptid: Ptid) -> bool {
        forward!(self, borrow, stopped_by_sw_breakpoint(ptid))
    }

    pub fn can_execute_reverse(self) -> bool {
        forward!(self, borrow, can_execute_reverse())
    }

    pub fn is_replaying(self) -> bool {
        forward!(self, borrow, is_replaying())
    }

    pub fn get_bookmark(self, ptid: Ptid) -> Result<Vec<u8>, Error> {
        forward!(self, borrow_mut, get_bookmark(ptid))
    }

    pub fn goto_bookmark(self, token: &[u8], ptid: Ptid) -> Result<(), Error> {
        forward!(self, borrow_mut, goto_bookmark(token, ptid))
    }

    /// Read exactly `buf.len()` bytes of raw memory below this layer.
    pub fn read_memory(self, addr: CoreAddr, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let res = self.xfer_partial(
                TargetObject::RawMemory,
                addr + done as u64,
                TransferRequest::Read(&mut buf[done..]),
            )?;
            match res {
                Transfer::Done(n) => done += n.get(),
                Transfer::Io(e) => return Err(e.into()),
                Transfer::Eof | Transfer::Unavailable => {
                    return Err(TransferError::Inaccessible(addr + done as u64).into())
                }
            }
        }
        Ok(())
    }

    /// Write all of `data` to raw memory below this layer.
    pub fn write_memory(self, addr: CoreAddr, data: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < data.len() {
            let res = self.xfer_partial(
                TargetObject::RawMemory,
                addr + done as u64,
                TransferRequest::Write(&data[done..]),
            )?;
            match res {
                Transfer::Done(n) => done += n.get(),
                Transfer::Io(e) => return Err(e.into()),
                Transfer::Eof | Transfer::Unavailable => {
                    return Err(TransferError::Inaccessible(addr + done as u64).into())
                }
            }
        }
        Ok(())
    }
}

/// Memory access used by collaborators (unwinders, register layouts, record hooks).
pub trait TargetMemory {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<(), Error>;

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<(), Error>;

    fn read_u64(&mut self, addr: CoreAddr) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_memory(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u32(&mut self, addr: CoreAddr) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_memory(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

impl<'a> TargetMemory for Beneath<'a> {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<(), Error> {
        Beneath::read_memory(*self, addr, buf)
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<(), Error> {
        Beneath::write_memory(*self, addr, data)
    }
}
