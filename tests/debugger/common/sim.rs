//! Simulated machine used as the process stratum in tests.
//!
//! Instructions are 4 bytes long: opcode, register number, 16-bit little-endian immediate.
//! The stack grows down, `CALL` pushes the 8-byte return address.

use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use strata::debugger::arch::{
    Arch, FrameId, FrameInfo, FrameKind, RecordEffect, ReturnType, UnwindContext, Unwinder,
    ValueClass,
};
use strata::debugger::error::{Error, TransferError};
use strata::debugger::ptid::Ptid;
use strata::debugger::register::RegisterCache;
use strata::debugger::target::{
    Beneath, BreakpointInsertion, BreakpointSite, ResumeRequest, Stratum, Target, TargetMemory,
    TargetObject, Transfer, TransferRequest, WaitOptions, WaitStatus, ExecDirection,
};
use strata::debugger::CoreAddr;

pub const PID: i32 = 42;
pub const MEM_SIZE: usize = 0x10000;
pub const STACK_TOP: u64 = 0xF000;
/// Distance between initial stack pointers of neighbour cpus.
const STACK_SPACING: u64 = 0x800;
/// Instructions executed by a non-blocking wait.
const NOHANG_BUDGET: usize = 64;

pub const REGISTERS: &[&str] = &["pc", "sp", "r0", "r1", "r2", "r3"];

pub const NOP: u8 = 0x01;
pub const CALL: u8 = 0x02;
pub const RET: u8 = 0x03;
pub const STORE: u8 = 0x04;
pub const ADDI: u8 = 0x05;
pub const JMP: u8 = 0x06;
pub const RAISE: u8 = 0x07;
pub const BRK: u8 = 0xCC;
pub const HALT: u8 = 0xFF;

pub fn insn(op: u8, reg: u8, imm: u16) -> [u8; 4] {
    let imm = imm.to_le_bytes();
    [op, reg, imm[0], imm[1]]
}

fn decode(raw: [u8; 4]) -> (u8, usize, u64) {
    (raw[0], raw[1] as usize, u16::from_le_bytes([raw[2], raw[3]]) as u64)
}

pub fn cpu_ptid(idx: usize) -> Ptid {
    Ptid::new(PID, idx as i64 + 1, 0)
}

#[derive(Clone, Debug, Default)]
pub struct Cpu {
    pub pc: u64,
    pub sp: u64,
    pub r: [u64; 4],
    running: bool,
    stepping: bool,
    by_breakpoint: bool,
}

impl Cpu {
    fn reg_mut(&mut self, name: &str) -> Option<&mut u64> {
        match name {
            "pc" => Some(&mut self.pc),
            "sp" => Some(&mut self.sp),
            "r0" => Some(&mut self.r[0]),
            "r1" => Some(&mut self.r[1]),
            "r2" => Some(&mut self.r[2]),
            "r3" => Some(&mut self.r[3]),
            _ => None,
        }
    }
}

pub struct SimState {
    pub mem: Vec<u8>,
    pub cpus: Vec<Cpu>,
    entries: Vec<u64>,
    pub created: bool,
    pub killed: bool,
    pub detached: bool,
    pub exited: Option<i32>,
    /// Signals given with resume requests.
    pub delivered: Vec<(Ptid, Signal)>,
    pub resumes: usize,
    /// Number of the resume request the machine refuses.
    pub fail_resume: Option<usize>,
    stop_request: Option<Ptid>,
    next_cpu: usize,
}

impl SimState {
    fn reset(&mut self) {
        self.cpus = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| Cpu {
                pc: *entry,
                sp: STACK_TOP - idx as u64 * STACK_SPACING,
                ..Cpu::default()
            })
            .collect();
        self.created = true;
        self.killed = false;
        self.detached = false;
        self.exited = None;
        self.stop_request = None;
        self.next_cpu = 0;
    }

    fn alive(&self) -> bool {
        self.created && self.exited.is_none() && !self.killed && !self.detached
    }

    fn cpu_idx(&self, ptid: Ptid) -> Option<usize> {
        let idx = ptid.lwp.checked_sub(1)? as usize;
        (ptid.pid == PID && ptid.tid == 0 && idx < self.cpus.len()).then_some(idx)
    }

    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let start = addr as usize;
        let bytes = self.mem.get(start..start + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> bool {
        let start = addr as usize;
        match self.mem.get_mut(start..start + 8) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    fn halt_all(&mut self) {
        for cpu in &mut self.cpus {
            cpu.running = false;
            cpu.stepping = false;
        }
    }

    /// Execute one instruction of a cpu, return the event it produced.
    fn exec_one(&mut self, idx: usize) -> Option<WaitStatus> {
        let pc = self.cpus[idx].pc;
        let Some(raw) = self
            .mem
            .get(pc as usize..pc as usize + 4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
        else {
            return Some(WaitStatus::Stopped(Signal::SIGSEGV));
        };
        let (op, reg, imm) = decode(raw);
        let mut next = pc + 4;
        match op {
            BRK => {
                self.cpus[idx].by_breakpoint = true;
                return Some(WaitStatus::Stopped(Signal::SIGTRAP));
            }
            NOP => {}
            CALL => {
                let sp = self.cpus[idx].sp - 8;
                if !self.write_u64(sp, pc + 4) {
                    return Some(WaitStatus::Stopped(Signal::SIGSEGV));
                }
                self.cpus[idx].sp = sp;
                next = imm;
            }
            RET => {
                let sp = self.cpus[idx].sp;
                let Some(ret) = self.read_u64(sp) else {
                    return Some(WaitStatus::Stopped(Signal::SIGSEGV));
                };
                self.cpus[idx].sp = sp + 8;
                next = ret;
            }
            STORE => {
                let value = self.cpus[idx].r[reg % 4];
                if !self.write_u64(imm, value) {
                    return Some(WaitStatus::Stopped(Signal::SIGSEGV));
                }
            }
            ADDI => self.cpus[idx].r[reg % 4] += imm,
            JMP => next = imm,
            RAISE => {
                self.cpus[idx].pc = next;
                let signal = Signal::try_from(imm as i32).unwrap_or(Signal::SIGILL);
                return Some(WaitStatus::Stopped(signal));
            }
            HALT => return Some(WaitStatus::Exited(self.cpus[idx].r[0] as i32)),
            _ => return Some(WaitStatus::Stopped(Signal::SIGILL)),
        }
        self.cpus[idx].pc = next;
        None
    }
}

/// Shared handle to the machine state, tests inspect and modify it directly.
#[derive(Clone)]
pub struct Sim(Rc<RefCell<SimState>>);

impl Sim {
    /// Machine with a cpu per entry address. Cpus start executing when a process is created.
    pub fn new(entries: &[u64]) -> Self {
        Self(Rc::new(RefCell::new(SimState {
            mem: vec![0; MEM_SIZE],
            cpus: vec![],
            entries: entries.to_vec(),
            created: false,
            killed: false,
            detached: false,
            exited: None,
            delivered: vec![],
            resumes: 0,
            fail_resume: None,
            stop_request: None,
            next_cpu: 0,
        })))
    }

    pub fn load(&self, addr: u64, code: &[[u8; 4]]) {
        let mut state = self.0.borrow_mut();
        for (i, insn) in code.iter().enumerate() {
            let at = addr as usize + i * 4;
            state.mem[at..at + 4].copy_from_slice(insn);
        }
    }

    pub fn state(&self) -> std::cell::Ref<'_, SimState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, SimState> {
        self.0.borrow_mut()
    }

    pub fn target(&self) -> SimTarget {
        SimTarget {
            state: self.0.clone(),
        }
    }
}

pub struct SimTarget {
    state: Rc<RefCell<SimState>>,
}

impl Target for SimTarget {
    fn shortname(&self) -> &'static str {
        "sim"
    }

    fn longname(&self) -> String {
        format!("simulated machine ({} cpus)", self.state.borrow().entries.len())
    }

    fn stratum(&self) -> Stratum {
        Stratum::Process
    }

    fn xfer_partial(
        &mut self,
        _: Beneath<'_>,
        _: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        if offset as usize >= MEM_SIZE {
            return Ok(Transfer::Io(TransferError::Inaccessible(offset)));
        }
        let start = offset as usize;
        let len = req.len().min(MEM_SIZE - start);
        let mut state = self.state.borrow_mut();
        match req {
            TransferRequest::Read(buf) => {
                buf[..len].copy_from_slice(&state.mem[start..start + len]);
            }
            TransferRequest::Write(data) => {
                state.mem[start..start + len].copy_from_slice(&data[..len]);
            }
        }
        Ok(Transfer::done(len))
    }

    fn has_all_memory(&self) -> bool {
        true
    }

    fn has_memory(&self, _: Beneath<'_>) -> bool {
        true
    }

    fn has_execution(&self, _: Beneath<'_>) -> bool {
        self.state.borrow().alive()
    }

    fn fetch_registers(
        &mut self,
        _: Beneath<'_>,
        ptid: Ptid,
        regs: &mut RegisterCache,
    ) -> Result<(), Error> {
        let state = self.state.borrow();
        let idx = state.cpu_idx(ptid).ok_or(Error::ThreadNotFound(ptid))?;
        let cpu = &state.cpus[idx];
        regs.supply_u64("pc", cpu.pc);
        regs.supply_u64("sp", cpu.sp);
        for (i, value) in cpu.r.iter().enumerate() {
            regs.supply_u64(&format!("r{i}"), *value);
        }
        Ok(())
    }

    fn store_registers(
        &mut self,
        _: Beneath<'_>,
        ptid: Ptid,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let idx = state.cpu_idx(ptid).ok_or(Error::ThreadNotFound(ptid))?;
        let cpu = &mut state.cpus[idx];
        for name in REGISTERS {
            if let (Some(value), Some(slot)) = (regs.get_u64(name), cpu.reg_mut(name)) {
                *slot = value;
            }
        }
        Ok(())
    }

    fn resume(&mut self, _: Beneath<'_>, req: ResumeRequest) -> Result<(), Error> {
        if req.direction == ExecDirection::Reverse {
            return Err(Error::Unsupported("reverse execution"));
        }
        let mut state = self.state.borrow_mut();
        if !state.alive() {
            return Err(Error::NoProcess);
        }
        if state.fail_resume == Some(state.resumes + 1) {
            return Err(Error::Refused {
                layer: "sim",
                reason: "resume refused".to_string(),
            });
        }
        state.resumes += 1;
        if let Some(signal) = req.signal {
            state.delivered.push((req.thread, signal));
        }
        for idx in 0..state.cpus.len() {
            let ptid = cpu_ptid(idx);
            if ptid.matches(req.scope) || ptid == req.thread {
                let cpu = &mut state.cpus[idx];
                cpu.running = true;
                cpu.by_breakpoint = false;
                cpu.stepping = req.step && ptid == req.thread;
            }
        }
        Ok(())
    }

    fn wait(
        &mut self,
        _: Beneath<'_>,
        _: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let mut state = self.state.borrow_mut();
        if let Some(ptid) = state.stop_request.take() {
            state.halt_all();
            return Ok(Some((ptid, WaitStatus::Stopped(Signal::SIGSTOP))));
        }

        let budget = if opts.nohang {
            NOHANG_BUDGET
        } else {
            usize::MAX
        };
        for _ in 0..budget {
            let count = state.cpus.len();
            let Some(idx) = (0..count)
                .map(|i| (state.next_cpu + i) % count)
                .find(|i| state.cpus[*i].running)
            else {
                if opts.nohang {
                    return Ok(None);
                }
                return Err(Error::Unsupported("blocking wait with nothing running"));
            };
            state.next_cpu = (idx + 1) % count;

            let status = state.exec_one(idx);
            let stepping = state.cpus[idx].stepping;
            match status {
                Some(WaitStatus::Exited(code)) => {
                    state.halt_all();
                    state.exited = Some(code);
                    return Ok(Some((Ptid::from_pid(PID), WaitStatus::Exited(code))));
                }
                Some(status) => {
                    state.halt_all();
                    return Ok(Some((cpu_ptid(idx), status)));
                }
                None if stepping => {
                    state.halt_all();
                    return Ok(Some((cpu_ptid(idx), WaitStatus::Stopped(Signal::SIGTRAP))));
                }
                None => {}
            }
        }
        Ok(None)
    }

    fn stop(&mut self, _: Beneath<'_>, ptid: Ptid) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let running = (0..state.cpus.len())
            .map(cpu_ptid)
            .zip(state.cpus.iter())
            .find(|(p, cpu)| cpu.running && p.matches(ptid))
            .map(|(p, _)| p);
        if let Some(running) = running {
            state.stop_request = Some(running);
        }
        Ok(())
    }

    fn create_inferior(
        &mut self,
        _: Beneath<'_>,
        _: &Path,
        _: &[String],
    ) -> Result<Ptid, Error> {
        self.state.borrow_mut().reset();
        Ok(cpu_ptid(0))
    }

    fn attach(&mut self, _: Beneath<'_>, pid: i32) -> Result<Ptid, Error> {
        if pid != PID {
            return Err(Error::NoProcess);
        }
        self.state.borrow_mut().reset();
        Ok(Ptid::from_pid(PID))
    }

    fn detach(&mut self, _: Beneath<'_>, _: i32) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.halt_all();
        state.detached = true;
        Ok(())
    }

    fn kill(&mut self, _: Beneath<'_>, _: i32) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.halt_all();
        state.killed = true;
        Ok(())
    }

    fn mourn_inferior(&mut self, _: Beneath<'_>, _: i32) {}

    fn thread_alive(&self, _: Beneath<'_>, ptid: Ptid) -> bool {
        let state = self.state.borrow();
        state.alive() && state.cpu_idx(ptid).is_some()
    }

    fn update_thread_list(&mut self, _: Beneath<'_>, list: &mut Vec<Ptid>) -> Result<(), Error> {
        let state = self.state.borrow();
        if state.alive() {
            list.extend((0..state.cpus.len()).map(cpu_ptid));
        }
        Ok(())
    }

    fn pid_to_str(&self, _: Beneath<'_>, ptid: Ptid) -> String {
        if ptid.is_process() {
            format!("process {}", ptid.pid)
        } else {
            format!("cpu {}", ptid.lwp)
        }
    }

    fn insert_breakpoint(
        &mut self,
        _: Beneath<'_>,
        _: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        Ok(BreakpointInsertion::UseMemory)
    }

    fn remove_breakpoint(
        &mut self,
        _: Beneath<'_>,
        _: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        Ok(BreakpointInsertion::UseMemory)
    }

    fn stopped_by_sw_breakpoint(&self, _: Beneath<'_>, ptid: Ptid) -> bool {
        let state = self.state.borrow();
        state
            .cpu_idx(ptid)
            .map(|idx| state.cpus[idx].by_breakpoint)
            .unwrap_or(false)
    }
}

pub struct SimArch;

impl Arch for SimArch {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn register_names(&self) -> &'static [&'static str] {
        REGISTERS
    }

    fn pc_register(&self) -> &'static str {
        "pc"
    }

    fn sp_register(&self) -> &'static str {
        "sp"
    }

    fn breakpoint_instruction(&self) -> &'static [u8] {
        &[BRK]
    }

    fn return_value(
        &self,
        regs: &RegisterCache,
        ty: &ReturnType,
    ) -> Result<Option<Vec<u8>>, Error> {
        if ty.class == ValueClass::Void {
            return Ok(None);
        }
        let raw = regs
            .get("r0")
            .ok_or_else(|| Error::RegisterUnavailable("r0".to_string()))?;
        Ok(Some(raw[..ty.size.min(raw.len())].to_vec()))
    }

    fn process_record(
        &self,
        regs: &RegisterCache,
        mem: &mut dyn TargetMemory,
    ) -> Result<Vec<RecordEffect>, Error> {
        let pc = regs
            .get_u64("pc")
            .ok_or_else(|| Error::RegisterUnavailable("pc".to_string()))?;
        let sp = regs.get_u64("sp").unwrap_or_default();
        let (op, reg, imm) = decode(mem.read_u32(pc)?.to_le_bytes());
        Ok(match op {
            ADDI => vec![RecordEffect::Register(format!("r{}", reg % 4))],
            CALL => vec![
                RecordEffect::Register("sp".to_string()),
                RecordEffect::Memory {
                    addr: sp - 8,
                    len: 8,
                },
            ],
            RET => vec![RecordEffect::Register("sp".to_string())],
            STORE => vec![RecordEffect::Memory { addr: imm, len: 8 }],
            _ => vec![],
        })
    }
}

/// Frame of depth `k` sits `8 * k` bytes above the stack pointer, a zero return address ends
/// the chain.
///
/// `tail_calls` pairs a callee entry with a pc of the function that tail-called it, frames of
/// the callee are followed by a virtual tail-call frame at that pc.
#[derive(Default)]
pub struct SimUnwinder {
    pub tail_calls: Vec<(CoreAddr, CoreAddr)>,
}

impl Unwinder for SimUnwinder {
    fn unwind(&self, ctx: UnwindContext<'_>) -> Result<Vec<FrameInfo>, Error> {
        let mut pc = ctx
            .regs
            .get_u64("pc")
            .ok_or_else(|| Error::RegisterUnavailable("pc".to_string()))?;
        let mut sp = ctx
            .regs
            .get_u64("sp")
            .ok_or_else(|| Error::RegisterUnavailable("sp".to_string()))?;

        let mut frames = vec![];
        while frames.len() < ctx.max_frames {
            let function = ctx.symbols.function_at(pc);
            let tail_caller = function.as_ref().and_then(|f| {
                self.tail_calls
                    .iter()
                    .find(|(callee, _)| *callee == f.low)
                    .map(|(_, caller_pc)| *caller_pc)
            });
            frames.push(FrameInfo {
                level: frames.len(),
                pc,
                id: FrameId {
                    stack: sp,
                    code: function.as_ref().map(|f| f.low).unwrap_or(pc),
                },
                kind: FrameKind::Normal,
                writable: true,
                function,
            });

            if let Some(caller_pc) = tail_caller.filter(|_| frames.len() < ctx.max_frames) {
                let function = ctx.symbols.function_at(caller_pc);
                frames.push(FrameInfo {
                    level: frames.len(),
                    pc: caller_pc,
                    id: FrameId {
                        stack: sp,
                        code: function.as_ref().map(|f| f.low).unwrap_or(caller_pc),
                    },
                    kind: FrameKind::TailCall,
                    writable: false,
                    function,
                });
            }

            match ctx.mem.read_u64(sp) {
                Ok(ret) if ret != 0 => {
                    pc = ret;
                    sp += 8;
                }
                _ => break,
            }
        }
        Ok(frames)
    }
}
