//! Inferior run control: resume, wait, interpret stops, drive the state machine of the command.

use crate::debugger::arch::ReturnValue;
use crate::debugger::breakpoint::{BreakpointKind, MomentaryKind};
use crate::debugger::error::Error;
use crate::debugger::fsm::FsmVerdict;
use crate::debugger::ptid::Ptid;
use crate::debugger::symbols::{LineRange, SourceLocation};
use crate::debugger::target::{
    BreakpointSite, ExecDirection, ResumeRequest, Stratum, WaitOptions, WaitStatus,
};
use crate::debugger::thread::{StepOverCalls, StepRange, ThreadState};
use crate::debugger::{CoreAddr, Debugger};
use crate::{muted_error, sd_debug, sd_trace, weak_error};
use nix::sys::signal::Signal;
use std::time::Duration;

/// Sleep between non-blocking wait attempts, a SIGCHLD wakes the loop earlier.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stop of a unit as seen by a state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopEvent {
    pub ptid: Ptid,
    pub pc: CoreAddr,
    /// The unit left its stepping range and stepping logic decided to stop.
    pub stop_step: bool,
    /// Breakpoints triggered by the stop.
    pub bpstat: Vec<u32>,
    pub signal: Option<Signal>,
}

/// Why control returned to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndSteppingRange,
    FunctionFinished(Option<ReturnValue>),
    LocationReached,
    BreakpointHit(Vec<u32>),
    Signal(Signal),
    Interrupted,
    Exited(i32),
    Signalled(Signal),
    /// Replay reached an end of the execution log.
    NoHistory,
}

/// Result of an execution command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopOutcome {
    pub ptid: Ptid,
    pub pc: Option<CoreAddr>,
    pub location: Option<SourceLocation>,
    pub reason: StopReason,
}

enum EventAction {
    /// Resume the unit and wait again.
    KeepGoing(Ptid),
    /// Wait again without resuming anything.
    Wait,
    Stop(StopEvent, StopReason),
}

enum StepDecision {
    KeepGoing,
    StopStep,
}

impl Debugger {
    /// Resume the program and run it until the command of `thread` completes.
    ///
    /// On error every machine of the process is cleaned up and breakpoints are removed.
    pub(super) fn proceed(&mut self, thread: Ptid) -> Result<StopOutcome, Error> {
        match self.run_until_stop(thread) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abort_execution(thread.pid);
                Err(e)
            }
        }
    }

    fn run_until_stop(&mut self, thread: Ptid) -> Result<StopOutcome, Error> {
        let mut resume = Some(thread);
        loop {
            let (ptid, status) = match resume {
                Some(unit) => match self.resume_unit(unit)? {
                    Some(event) => event,
                    None => self.wait_inferior(unit.pid)?,
                },
                None => self.wait_inferior(thread.pid)?,
            };
            sd_trace!(target: "infrun", "{ptid}: {status:?}");

            let (event, reason) = match self.handle_inferior_event(ptid, status)? {
                EventAction::KeepGoing(unit) => {
                    resume = Some(unit);
                    continue;
                }
                EventAction::Wait => {
                    resume = None;
                    continue;
                }
                EventAction::Stop(event, reason) => (event, reason),
            };

            let fsm = self
                .threads_mut(event.ptid.pid)
                .and_then(|threads| threads.get_mut(event.ptid))
                .and_then(|t| t.fsm.take());
            let reason = match fsm {
                Some(mut fsm) => {
                    let verdict = match fsm.should_stop(self, &event) {
                        Ok(verdict) => verdict,
                        Err(e) => {
                            fsm.clean_up(self);
                            return Err(e);
                        }
                    };
                    if verdict == FsmVerdict::KeepGoing {
                        if let Some(t) = self
                            .threads_mut(event.ptid.pid)
                            .and_then(|threads| threads.get_mut(event.ptid))
                        {
                            t.fsm = Some(fsm);
                        }
                        resume = Some(event.ptid);
                        continue;
                    }
                    let reason = fsm.classify().unwrap_or(reason);
                    fsm.clean_up(self);
                    reason
                }
                None => reason,
            };

            return self.normal_stop(StopOutcome {
                ptid: event.ptid,
                pc: Some(event.pc),
                location: None,
                reason,
            });
        }
    }

    /// Insert breakpoints and resume a unit as its stepping state requires.
    ///
    /// Stepping over a breakpoint inserted at the unit pc may already produce the event of a
    /// single step, it is returned then.
    fn resume_unit(&mut self, thread: Ptid) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let pid = thread.pid;
        let direction = self.direction;
        self.prepare_to_resume(pid)?;

        let pc = self.thread_pc(thread)?;
        let (step, scope, mut signal) = {
            let info = self.thread_mut(thread)?;
            let stepping = info.control.step_range.is_some();
            let step = stepping && info.control.step_resume_bp.is_none();
            let scope = if stepping { thread } else { thread.process() };
            (step, scope, info.stop_signal.take())
        };

        let idx = self.inferior_index(pid)?;
        let must_step_over = {
            let inf = &self.inferiors[idx];
            direction == ExecDirection::Forward
                && inf.memory.breakpoint_inserted(pc)
                && !inf.stack.top().is_replaying()
        };

        if must_step_over {
            sd_debug!(target: "infrun", "{thread}: step over breakpoint at {pc:#x}");
            {
                let inf = &mut self.inferiors[idx];
                inf.memory.remove_breakpoint(&inf.stack, pc)?;
                inf.stack.top().resume(ResumeRequest {
                    scope: thread,
                    thread,
                    step: true,
                    signal,
                    direction,
                })?;
            }
            self.set_running(thread, thread);
            let event = self.wait_inferior(pid)?;

            if let (_, WaitStatus::Stopped(_)) = event {
                let site = BreakpointSite {
                    addr: pc,
                    insn: self.arch.breakpoint_instruction().to_vec(),
                };
                let inf = &mut self.inferiors[idx];
                inf.memory.insert_breakpoint(&inf.stack, &site)?;
            }
            if step || event != (thread, WaitStatus::Stopped(Signal::SIGTRAP)) {
                return Ok(Some(event));
            }
            // the unit is past the breakpoint, carry on with the original request
            self.invalidate_state(pid);
            signal = None;
        }

        {
            let inf = &mut self.inferiors[idx];
            inf.stack.top().resume(ResumeRequest {
                scope,
                thread,
                step,
                signal,
                direction,
            })?;
        }
        self.set_running(scope, thread);
        Ok(None)
    }

    /// Drop cached state and insert breakpoints. Must happen before the program resumes.
    fn prepare_to_resume(&mut self, pid: i32) -> Result<(), Error> {
        self.invalidate_state(pid);
        let locations = self.breakpoints.locations_for(pid);
        let insn = self.arch.breakpoint_instruction().to_vec();
        let idx = self.inferior_index(pid)?;
        let inf = &mut self.inferiors[idx];
        for addr in locations {
            let site = BreakpointSite {
                addr,
                insn: insn.clone(),
            };
            inf.memory.insert_breakpoint(&inf.stack, &site)?;
        }
        Ok(())
    }

    fn set_running(&mut self, scope: Ptid, thread: Ptid) {
        if let Some(threads) = self.threads_mut(thread.pid) {
            for t in threads.iter_mut() {
                if t.ptid.matches(scope) || t.ptid == thread {
                    t.state = ThreadState::Running;
                    t.stop_pc = None;
                }
            }
        }
    }

    /// Remove every inserted breakpoint of the process.
    pub(super) fn remove_breakpoints(&mut self, pid: i32) {
        let Ok(idx) = self.inferior_index(pid) else {
            return;
        };
        let inf = &mut self.inferiors[idx];
        for addr in inf.memory.inserted_breakpoints() {
            weak_error!(
                inf.memory.remove_breakpoint(&inf.stack, addr),
                "remove breakpoint:"
            );
        }
    }

    /// Wait until some unit of the process reports an event. Async signal handlers are serviced
    /// while waiting.
    fn wait_inferior(&mut self, pid: i32) -> Result<(Ptid, WaitStatus), Error> {
        let event_loop = self.event_loop.clone();
        loop {
            let res = {
                let idx = self.inferior_index(pid)?;
                self.inferiors[idx]
                    .stack
                    .top()
                    .wait(Ptid::from_pid(pid), WaitOptions { nohang: true })?
            };
            if let Some(event) = res {
                return Ok(event);
            }
            event_loop.invoke_async_signal_handlers(self);
            event_loop.wait_for_wake(WAIT_POLL_INTERVAL)?;
        }
    }

    fn handle_inferior_event(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> Result<EventAction, Error> {
        let pid = ptid.pid;
        self.invalidate_state(pid);

        match status {
            WaitStatus::Exited(code) => {
                self.process_gone(pid);
                Ok(EventAction::Stop(
                    StopEvent {
                        ptid: Ptid::from_pid(pid),
                        pc: 0,
                        stop_step: false,
                        bpstat: vec![],
                        signal: None,
                    },
                    StopReason::Exited(code),
                ))
            }
            WaitStatus::Signalled(signal) => {
                self.process_gone(pid);
                Ok(EventAction::Stop(
                    StopEvent {
                        ptid: Ptid::from_pid(pid),
                        pc: 0,
                        stop_step: false,
                        bpstat: vec![],
                        signal: Some(signal),
                    },
                    StopReason::Signalled(signal),
                ))
            }
            WaitStatus::ThreadExited => {
                self.thread_gone(ptid);
                Ok(EventAction::Wait)
            }
            WaitStatus::Spurious => Ok(EventAction::KeepGoing(ptid)),
            WaitStatus::NoHistory => {
                self.note_stopped(ptid);
                let pc = self.thread_pc(ptid)?;
                Ok(EventAction::Stop(
                    StopEvent {
                        ptid,
                        pc,
                        stop_step: false,
                        bpstat: vec![],
                        signal: None,
                    },
                    StopReason::NoHistory,
                ))
            }
            WaitStatus::Stopped(signal) => self.handle_signal_stop(ptid, signal),
        }
    }

    /// Register a unit seen for the first time and mark the process stopped.
    fn note_stopped(&mut self, ptid: Ptid) {
        self.add_thread(ptid);
        if let Some(threads) = self.threads_mut(ptid.pid) {
            for t in threads.iter_mut() {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Stopped;
                }
            }
        }
    }

    fn handle_signal_stop(&mut self, ptid: Ptid, signal: Signal) -> Result<EventAction, Error> {
        self.note_stopped(ptid);
        let mut pc = self.thread_pc(ptid)?;

        if signal == Signal::SIGTRAP {
            let decr = self.arch.decr_pc_after_break();
            let idx = self.inferior_index(ptid.pid)?;
            let adjust = {
                let inf = &self.inferiors[idx];
                decr > 0
                    && inf.stack.top().stopped_by_sw_breakpoint(ptid)
                    && inf.memory.breakpoint_inserted(pc.wrapping_sub(decr))
            };
            if adjust {
                pc -= decr;
                self.write_pc(ptid, pc)?;
            }
        }
        self.thread_mut(ptid)?.stop_pc = Some(pc);

        let event = |stop_step, bpstat| StopEvent {
            ptid,
            pc,
            stop_step,
            bpstat,
            signal: Some(signal),
        };

        if matches!(signal, Signal::SIGINT | Signal::SIGSTOP) {
            let info = self.thread_mut(ptid)?;
            if info.stop_requested {
                info.stop_requested = false;
                return Ok(EventAction::Stop(event(false, vec![]), StopReason::Interrupted));
            }
        }

        if signal != Signal::SIGTRAP {
            let policy = self.signals.policy(signal);
            sd_debug!(target: "infrun", "{ptid} received {signal}: {policy:?}");
            if policy.pass {
                self.thread_mut(ptid)?.stop_signal = Some(signal);
            }
            if policy.stop {
                return Ok(EventAction::Stop(event(false, vec![]), StopReason::Signal(signal)));
            }
            return Ok(EventAction::KeepGoing(ptid));
        }

        let mut bpstat = if self.breakpoints.has_location(pc) {
            let frame = self.physical_frames(ptid)?.first().map(|f| f.id);
            self.breakpoints.stop_status(ptid, pc, frame)
        } else {
            vec![]
        };

        let step_resume = self.thread_mut(ptid)?.control.step_resume_bp;
        if let Some(sr) = step_resume.filter(|sr| bpstat.contains(sr)) {
            sd_debug!(target: "infrun", "{ptid}: step-resume breakpoint hit at {pc:#x}");
            self.breakpoints.discard(sr);
            self.thread_mut(ptid)?.control.step_resume_bp = None;
            bpstat.retain(|bp| *bp != sr);
            if bpstat.is_empty() && self.direction == ExecDirection::Reverse {
                // at the callee entry, one more step back reaches the call instruction
                return Ok(EventAction::KeepGoing(ptid));
            }
        }

        let kind_of = |dbg: &Debugger, number: &u32| dbg.breakpoints.get(*number).map(|bp| bp.kind);
        let user_hits: Vec<u32> = bpstat
            .iter()
            .copied()
            .filter(|n| kind_of(self, n) == Some(BreakpointKind::User))
            .collect();
        if !user_hits.is_empty() {
            return Ok(EventAction::Stop(
                event(false, bpstat),
                StopReason::BreakpointHit(user_hits),
            ));
        }

        if bpstat
            .iter()
            .any(|n| kind_of(self, n) == Some(BreakpointKind::Momentary(MomentaryKind::Longjmp)))
        {
            sd_debug!(target: "infrun", "{ptid}: non-local jump while stepping");
            return Ok(EventAction::Stop(
                event(true, bpstat),
                StopReason::EndSteppingRange,
            ));
        }

        if bpstat.iter().any(|n| {
            matches!(
                kind_of(self, n),
                Some(BreakpointKind::Momentary(
                    MomentaryKind::Finish | MomentaryKind::Until
                ))
            )
        }) {
            return Ok(EventAction::Stop(event(false, bpstat), StopReason::LocationReached));
        }

        let control = self.thread_mut(ptid)?.control.clone();
        if control.step_range.is_some() {
            if control.step_resume_bp.is_some() {
                return Ok(EventAction::KeepGoing(ptid));
            }
            return match self.step_decision(ptid, pc)? {
                StepDecision::KeepGoing => Ok(EventAction::KeepGoing(ptid)),
                StepDecision::StopStep => Ok(EventAction::Stop(
                    event(true, bpstat),
                    StopReason::EndSteppingRange,
                )),
            };
        }

        if !bpstat.is_empty() {
            // somebody else's momentary breakpoint
            return Ok(EventAction::KeepGoing(ptid));
        }
        Ok(EventAction::Stop(event(false, bpstat), StopReason::Signal(signal)))
    }

    fn refresh_step_range(&mut self, ptid: Ptid, line: LineRange) -> Result<(), Error> {
        let frame = self.physical_frames(ptid)?.first().map(|f| f.id);
        let control = &mut self.thread_mut(ptid)?.control;
        control.step_range = Some(StepRange::Range {
            start: line.start,
            end: line.end,
        });
        control.step_frame_id = frame;
        control.step_line = Some(line);
        Ok(())
    }

    fn insert_step_resume(
        &mut self,
        ptid: Ptid,
        addr: CoreAddr,
        frame: Option<crate::debugger::arch::FrameId>,
    ) -> Result<(), Error> {
        sd_debug!(target: "infrun", "{ptid}: insert step-resume breakpoint at {addr:#x}");
        let number =
            self.breakpoints
                .add_momentary(MomentaryKind::StepResume, addr, ptid, frame);
        let control = &mut self.thread_mut(ptid)?.control;
        if let Some(old) = control.step_resume_bp.replace(number) {
            self.breakpoints.discard(old);
        }
        Ok(())
    }

    /// Decide what a stepping unit does after a single step trap.
    fn step_decision(&mut self, ptid: Ptid, pc: CoreAddr) -> Result<StepDecision, Error> {
        let control = self.thread_mut(ptid)?.control.clone();
        let Some(range) = control.step_range else {
            return Ok(StepDecision::StopStep);
        };
        let reverse = self.direction == ExecDirection::Reverse;
        let frames = self.physical_frames(ptid)?;
        let frame = frames.first().map(|f| f.id);
        let caller = frames.get(1);
        let in_step_frame = control.step_frame_id.is_none() || frame == control.step_frame_id;

        if range.contains(pc) && in_step_frame {
            if let StepRange::Range { start, .. } = range {
                if reverse && pc == start {
                    return Ok(StepDecision::StopStep);
                }
            }
            return Ok(StepDecision::KeepGoing);
        }

        let entered_subroutine = control.step_frame_id.is_some()
            && caller.map(|c| c.id) == control.step_frame_id
            && frame != control.step_frame_id;
        if entered_subroutine {
            let line = self.symbols.line_at(pc);
            let step_over = match control.step_over_calls {
                StepOverCalls::None => return Ok(StepDecision::StopStep),
                StepOverCalls::All => true,
                StepOverCalls::Undebuggable => {
                    line.is_none() && !self.config.step_stop_if_no_debug
                }
            };

            if step_over {
                if reverse {
                    let entry = self.symbols.function_at(pc).map(|f| f.low);
                    if let Some(entry) = entry.filter(|e| *e != pc) {
                        self.insert_step_resume(ptid, entry, frame)?;
                    }
                } else if let Some(caller) = caller {
                    self.insert_step_resume(ptid, caller.pc, Some(caller.id))?;
                }
                return Ok(StepDecision::KeepGoing);
            }

            return match line {
                Some(line) if !reverse && line.start == pc => Ok(StepDecision::StopStep),
                Some(line) => {
                    let at_start = line.start == pc;
                    self.refresh_step_range(ptid, line)?;
                    if at_start {
                        return Ok(StepDecision::StopStep);
                    }
                    Ok(StepDecision::KeepGoing)
                }
                None => Ok(StepDecision::StopStep),
            };
        }

        if range == StepRange::Instruction || control.stop_on_exit {
            return Ok(StepDecision::StopStep);
        }

        let Some(line) = self.symbols.line_at(pc) else {
            sd_debug!(target: "infrun", "{ptid}: stepped into code without line information");
            return Ok(StepDecision::StopStep);
        };

        let same_line = |other: &Option<LineRange>| {
            other
                .as_ref()
                .map(|l| l.line == line.line && l.file == line.file)
                .unwrap_or(false)
        };

        if !reverse {
            if let Some(block) = self.symbols.inline_block_at(pc) {
                let covered = matches!(range, StepRange::Range { start, end } if start <= block.low && block.high <= end);
                if block.low == pc && !covered {
                    let call_on_step_line = match (&block.call_site, &control.step_line) {
                        (Some(site), Some(step_line)) => {
                            site.line == step_line.line
                                && (site.file.is_empty() || site.file == step_line.file)
                        }
                        _ => false,
                    };
                    sd_debug!(target: "infrun", "{ptid}: stepped into inlined function {}", block.name);
                    if control.step_over_calls == StepOverCalls::All {
                        if call_on_step_line {
                            let control = &mut self.thread_mut(ptid)?.control;
                            control.step_range = Some(StepRange::Range {
                                start: block.low,
                                end: block.high,
                            });
                            return Ok(StepDecision::KeepGoing);
                        }
                        self.thread_mut(ptid)?.inline_skipped = Some(block);
                        return Ok(StepDecision::StopStep);
                    }
                    let info = self.thread_mut(ptid)?;
                    info.inline_skipped = if call_on_step_line { None } else { Some(block) };
                    return Ok(StepDecision::StopStep);
                }
            }
        }

        if !in_step_frame {
            if !reverse {
                // returned into the caller
                return Ok(StepDecision::StopStep);
            }
            let at_start = line.start == pc;
            self.refresh_step_range(ptid, line)?;
            return Ok(if at_start {
                StepDecision::StopStep
            } else {
                StepDecision::KeepGoing
            });
        }

        if pc == line.start && !same_line(&control.step_line) {
            return Ok(StepDecision::StopStep);
        }

        // middle of a line or another range of the stepped line, finish it
        let at_start = line.start == pc;
        self.refresh_step_range(ptid, line)?;
        if reverse && at_start {
            return Ok(StepDecision::StopStep);
        }
        Ok(StepDecision::KeepGoing)
    }

    /// Finish an execution command: remove breakpoints, abandon leftover machines, notify UIs.
    pub(super) fn normal_stop(&mut self, mut outcome: StopOutcome) -> Result<StopOutcome, Error> {
        let pid = outcome.ptid.pid;
        let alive = self
            .inferior_index(pid)
            .map(|idx| self.inferiors[idx].pid.is_some())
            .unwrap_or(false);

        if alive {
            self.remove_breakpoints(pid);
            self.invalidate_state(pid);
            self.clean_up_machines(pid);
            weak_error!(self.update_thread_list(pid), "update thread list:");
            if let Some(threads) = self.threads_mut(pid) {
                for t in threads.iter_mut() {
                    t.stop_requested = false;
                    if t.state == ThreadState::Running {
                        t.state = ThreadState::Stopped;
                    }
                }
            }

            if let Some(pc) = outcome.pc {
                outcome.location = self.symbols.line_at(pc).map(|l| l.location());
                if outcome.reason != StopReason::EndSteppingRange {
                    let skipped = self
                        .symbols
                        .inline_block_at(pc)
                        .filter(|block| block.low == pc);
                    if let Ok(info) = self.thread_mut(outcome.ptid) {
                        info.inline_skipped = skipped;
                    }
                }
            }
            if self.thread(outcome.ptid).is_some() {
                self.selected_thread = Some(outcome.ptid);
            }
        }

        sd_debug!(target: "infrun", "stop {}: {:?}", outcome.ptid, outcome.reason);
        for hook in &self.hooks {
            let res = match outcome.reason {
                StopReason::Exited(code) => {
                    hook.on_exit(pid, code);
                    Ok(())
                }
                StopReason::Signal(signal) | StopReason::Signalled(signal) => {
                    hook.on_signal(outcome.ptid, signal);
                    hook.on_stop(&outcome)
                }
                _ => hook.on_stop(&outcome),
            };
            muted_error!(res.map_err(Error::Hook), "stop hook:");
        }
        Ok(outcome)
    }

    /// Clean up machines of every unit of the process.
    pub(super) fn clean_up_machines(&mut self, pid: i32) {
        let machines: Vec<_> = self
            .threads_mut(pid)
            .map(|threads| threads.iter_mut().filter_map(|t| t.fsm.take()).collect())
            .unwrap_or_default();
        for mut fsm in machines {
            sd_debug!(target: "infrun", "{}: abandon {} command", fsm.thread(), fsm.name());
            fsm.clean_up(self);
        }
    }

    /// An execution command failed: abandon machines, remove breakpoints.
    fn abort_execution(&mut self, pid: i32) {
        self.clean_up_machines(pid);
        self.remove_breakpoints(pid);
        if let Some(threads) = self.threads_mut(pid) {
            for t in threads.iter_mut() {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Stopped;
                }
            }
        }
    }

    /// The process exited or was killed, forget its units and its run-time layers.
    pub(super) fn process_gone(&mut self, pid: i32) {
        sd_debug!(target: "infrun", "process {pid} is gone");
        self.clean_up_machines(pid);
        self.breakpoints.discard_momentary_of(pid);
        let Ok(idx) = self.inferior_index(pid) else {
            return;
        };
        let inf = &mut self.inferiors[idx];
        inf.memory.forget_breakpoints();
        inf.memory.invalidate_cache();
        inf.stack.top().mourn_inferior(pid);
        weak_error!(inf.stack.unpush_above(Stratum::File), "unpush run-time layers:");
        inf.threads.clear();
        inf.pid = None;
        if self.selected_thread.map(|t| t.pid) == Some(pid) {
            self.selected_thread = None;
        }
    }

    pub(super) fn thread_gone(&mut self, ptid: Ptid) {
        let fsm = self
            .threads_mut(ptid.pid)
            .and_then(|threads| threads.get_mut(ptid))
            .and_then(|t| t.fsm.take());
        if let Some(mut fsm) = fsm {
            fsm.clean_up(self);
        }
        if let Some(threads) = self.threads_mut(ptid.pid) {
            threads.remove(ptid);
        }
        if self.selected_thread == Some(ptid) {
            self.selected_thread = None;
        }
    }
}
