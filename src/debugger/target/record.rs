//! Process record and replay.
//!
//! While recording, the layer single-steps the unit beneath and logs what every instruction is
//! about to change (as listed by the architecture). Replay in both directions swaps logged values
//! with the live ones, so every log entry always holds "the other side" of its instruction.
//!
//! Breakpoints never reach program memory while this layer is pushed: the layer checks them
//! itself after every instruction, in both recording and replay modes.

use crate::debugger::arch::{Arch, RecordEffect};
use crate::debugger::error::Error;
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::target::{
    Beneath, BreakpointInsertion, BreakpointSite, ExecDirection, ResumeRequest, Stratum, Target,
    TargetObject, Transfer, TransferRequest, WaitOptions, WaitStatus,
};
use crate::debugger::CoreAddr;
use crate::{sd_debug, sd_trace};
use nix::sys::signal::Signal;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

/// Instructions executed by a single `wait` call, bounds the time between event loop passes.
const BATCH: usize = 4096;

#[derive(Debug, Default)]
struct RecordEntry {
    ptid: Ptid,
    regs: Vec<(String, Vec<u8>)>,
    mem: Vec<(CoreAddr, Vec<u8>)>,
}

impl RecordEntry {
    /// Exchange logged values with the live state.
    fn swap(&mut self, beneath: Beneath<'_>) -> Result<(), Error> {
        if !self.regs.is_empty() {
            let mut live = RegisterCache::new();
            beneath.fetch_registers(self.ptid, &mut live)?;
            let mut update = live.clone();
            for (name, value) in &mut self.regs {
                let current = live.get(name).map(|raw| raw.to_vec()).unwrap_or_default();
                update.supply(name, value);
                *value = current;
            }
            beneath.store_registers(self.ptid, &update)?;
        }
        for (addr, value) in &mut self.mem {
            let mut current = vec![0; value.len()];
            beneath.read_memory(*addr, &mut current)?;
            beneath.write_memory(*addr, value)?;
            *value = current;
        }
        Ok(())
    }
}

pub struct RecordTarget {
    arch: Rc<dyn Arch>,
    insn_limit: usize,
    log: VecDeque<RecordEntry>,
    /// Replay position: the live state is the state before `log[cursor]`.
    /// `cursor == log.len()` means the program is not replaying.
    cursor: usize,
    /// Number of entries dropped from the log head.
    dropped: u64,
    breakpoints: BTreeSet<CoreAddr>,
    resumed: Option<ResumeRequest>,
    /// Current resume moves inside the log and never records.
    replay_resume: bool,
    interrupt: bool,
}

impl RecordTarget {
    pub fn new(arch: Rc<dyn Arch>, insn_limit: usize) -> Self {
        Self {
            arch,
            insn_limit: insn_limit.max(1),
            log: VecDeque::new(),
            cursor: 0,
            dropped: 0,
            breakpoints: BTreeSet::new(),
            resumed: None,
            replay_resume: false,
            interrupt: false,
        }
    }

    fn replaying(&self) -> bool {
        self.cursor < self.log.len()
    }

    /// Number of the instruction at the current position.
    fn insn_number(&self) -> u64 {
        self.dropped + self.cursor as u64
    }

    fn pc(&self, beneath: Beneath<'_>, ptid: Ptid) -> Result<CoreAddr, Error> {
        let mut regs = RegisterCache::new();
        beneath.fetch_registers(ptid, &mut regs)?;
        let name = self.arch.pc_register();
        regs.get_u64(name)
            .ok_or_else(|| Error::RegisterUnavailable(name.to_string()))
    }

    fn refuse<T>(&self, what: &str) -> Result<T, Error> {
        Err(Error::Refused {
            layer: "record",
            reason: format!("cannot {what} while replaying the execution history"),
        })
    }

    /// Step backward over one logged instruction. `false` at the history start.
    fn step_back(&mut self, beneath: Beneath<'_>) -> Result<bool, Error> {
        if self.cursor == 0 {
            return Ok(false);
        }
        self.cursor -= 1;
        self.log[self.cursor].swap(beneath)?;
        Ok(true)
    }

    /// Step forward over one logged instruction. `false` at the history end.
    fn step_forward(&mut self, beneath: Beneath<'_>) -> Result<bool, Error> {
        if !self.replaying() {
            return Ok(false);
        }
        self.log[self.cursor].swap(beneath)?;
        self.cursor += 1;
        Ok(true)
    }

    /// Execute one live instruction beneath, logging its effects first.
    fn record_one(
        &mut self,
        beneath: Beneath<'_>,
        thread: Ptid,
        signal: Option<Signal>,
    ) -> Result<WaitStatus, Error> {
        let mut regs = RegisterCache::new();
        beneath.fetch_registers(thread, &mut regs)?;
        let mut mem = beneath;
        let effects = self.arch.process_record(&regs, &mut mem)?;

        let mut entry = RecordEntry {
            ptid: thread,
            ..RecordEntry::default()
        };
        let pc_name = self.arch.pc_register();
        let mut logged_regs = vec![pc_name.to_string()];
        for effect in effects {
            match effect {
                RecordEffect::Register(name) if !logged_regs.contains(&name) => {
                    logged_regs.push(name)
                }
                RecordEffect::Register(_) => {}
                RecordEffect::Memory { addr, len } => {
                    let mut value = vec![0; len];
                    beneath.read_memory(addr, &mut value)?;
                    entry.mem.push((addr, value));
                }
            }
        }
        for name in logged_regs {
            let value = regs.get(&name).map(|raw| raw.to_vec()).unwrap_or_default();
            entry.regs.push((name, value));
        }

        beneath.resume(ResumeRequest {
            scope: thread,
            thread,
            step: true,
            signal,
            direction: ExecDirection::Forward,
        })?;
        let status = loop {
            if let Some((_, status)) = beneath.wait(thread, WaitOptions { nohang: false })? {
                if status != WaitStatus::Spurious {
                    break status;
                }
            }
        };

        if matches!(status, WaitStatus::Stopped(_)) {
            self.log.push_back(entry);
            if self.log.len() > self.insn_limit {
                self.log.pop_front();
                self.dropped += 1;
            }
            self.cursor = self.log.len();
        }
        Ok(status)
    }

    fn run_batch(
        &mut self,
        beneath: Beneath<'_>,
        req: ResumeRequest,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let thread = req.thread;
        let mut signal = req.signal;
        for _ in 0..BATCH {
            if self.interrupt {
                self.interrupt = false;
                return Ok(Some((thread, WaitStatus::Stopped(Signal::SIGSTOP))));
            }

            let moved = match req.direction {
                ExecDirection::Reverse => self.step_back(beneath)?,
                ExecDirection::Forward if self.replay_resume => self.step_forward(beneath)?,
                ExecDirection::Forward => match self.record_one(beneath, thread, signal.take())? {
                    WaitStatus::Stopped(Signal::SIGTRAP) => true,
                    status => return Ok(Some((thread, status))),
                },
            };
            if !moved {
                sd_debug!(target: "record", "end of the execution history reached");
                return Ok(Some((thread, WaitStatus::NoHistory)));
            }

            if req.step {
                return Ok(Some((thread, WaitStatus::Stopped(Signal::SIGTRAP))));
            }
            let pc = self.pc(beneath, thread)?;
            if self.breakpoints.contains(&pc) {
                sd_trace!(target: "record", "breakpoint at {pc:#x}");
                return Ok(Some((thread, WaitStatus::Stopped(Signal::SIGTRAP))));
            }
        }
        Ok(None)
    }

    fn move_to(&mut self, beneath: Beneath<'_>, target: usize) -> Result<(), Error> {
        while self.cursor > target {
            self.step_back(beneath)?;
        }
        while self.cursor < target {
            self.step_forward(beneath)?;
        }
        Ok(())
    }
}

impl Target for RecordTarget {
    fn shortname(&self) -> &'static str {
        "record-full"
    }

    fn longname(&self) -> String {
        format!(
            "process record and replay ({} instructions logged)",
            self.log.len()
        )
    }

    fn stratum(&self) -> Stratum {
        Stratum::Record
    }

    fn close(&mut self) {
        self.log.clear();
        self.cursor = 0;
        self.breakpoints.clear();
    }

    fn xfer_partial(
        &mut self,
        beneath: Beneath<'_>,
        object: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        if req.is_write() && self.replaying() {
            return self.refuse("write memory");
        }
        beneath.xfer_partial(object, offset, req)
    }

    fn store_registers(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        if self.replaying() {
            return self.refuse("write registers");
        }
        beneath.store_registers(ptid, regs)
    }

    fn resume(&mut self, _: Beneath<'_>, req: ResumeRequest) -> Result<(), Error> {
        sd_trace!(target: "record", "resume {req:?} at insn {}", self.insn_number());
        self.interrupt = false;
        self.replay_resume = self.replaying() || req.direction == ExecDirection::Reverse;
        self.resumed = Some(req);
        Ok(())
    }

    fn wait(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let Some(mut req) = self.resumed else {
            return beneath.wait(ptid, opts);
        };
        loop {
            let res = self.run_batch(beneath, req);
            // the signal is delivered by the first instruction only
            req.signal = None;
            self.resumed = matches!(res, Ok(None)).then_some(req);
            match res? {
                Some(event) => return Ok(Some(event)),
                None if opts.nohang => return Ok(None),
                None => {}
            }
        }
    }

    fn stop(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<(), Error> {
        if self.resumed.is_some() {
            self.interrupt = true;
            return Ok(());
        }
        beneath.stop(ptid)
    }

    fn kill(&mut self, beneath: Beneath<'_>, pid: i32) -> Result<(), Error> {
        self.close();
        beneath.kill(pid)
    }

    fn mourn_inferior(&mut self, beneath: Beneath<'_>, pid: i32) {
        self.close();
        self.resumed = None;
        beneath.mourn_inferior(pid)
    }

    fn insert_breakpoint(
        &mut self,
        beneath: Beneath<'_>,
        site: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        let mut shadow = vec![0; site.insn.len()];
        beneath.read_memory(site.addr, &mut shadow)?;
        self.breakpoints.insert(site.addr);
        Ok(BreakpointInsertion::Handled { shadow })
    }

    fn remove_breakpoint(
        &mut self,
        _: Beneath<'_>,
        site: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        self.breakpoints.remove(&site.addr);
        Ok(BreakpointInsertion::Handled { shadow: vec![] })
    }

    /// Stops are reported with the pc at the breakpoint address.
    fn stopped_by_sw_breakpoint(&self, _: Beneath<'_>, _: Ptid) -> bool {
        false
    }

    fn can_execute_reverse(&self, _: Beneath<'_>) -> bool {
        true
    }

    fn is_replaying(&self, _: Beneath<'_>) -> bool {
        self.replaying()
    }

    fn get_bookmark(&mut self, _: Beneath<'_>, _: Ptid) -> Result<Vec<u8>, Error> {
        Ok(self.insn_number().to_string().into_bytes())
    }

    fn goto_bookmark(
        &mut self,
        beneath: Beneath<'_>,
        token: &[u8],
        _: Ptid,
    ) -> Result<(), Error> {
        let token = String::from_utf8_lossy(token);
        let target = match token.trim() {
            "start" | "begin" => 0,
            "end" => self.log.len(),
            number => {
                let number: u64 = number.parse().map_err(|_| {
                    Error::InvalidArgument(format!("invalid record bookmark: {number}"))
                })?;
                if number < self.dropped || number - self.dropped > self.log.len() as u64 {
                    return Err(Error::InvalidArgument(format!(
                        "instruction {number} is not in the execution history"
                    )));
                }
                (number - self.dropped) as usize
            }
        };
        sd_debug!(target: "record", "goto insn {}", self.dropped + target as u64);
        self.move_to(beneath, target)
    }
}
