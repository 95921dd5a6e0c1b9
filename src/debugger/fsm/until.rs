use crate::debugger::arch::FrameKind;
use crate::debugger::breakpoint::MomentaryKind;
use crate::debugger::error::Error;
use crate::debugger::fsm::step::set_longjmp_guard;
use crate::debugger::fsm::{FsmCommon, FsmVerdict};
use crate::debugger::infrun::StopEvent;
use crate::debugger::ptid::Ptid;
use crate::debugger::thread::{StepOverCalls, StepRange, ThreadControl};
use crate::debugger::{CoreAddr, Debugger};

/// `until` without argument: like `next`, but never stops in a backward jump of the current
/// function.
pub struct UntilNextFsm {
    pub(super) common: FsmCommon,
    longjmp_bp: Option<u32>,
}

impl UntilNextFsm {
    pub fn prepare(dbg: &mut Debugger, thread: Ptid) -> Result<Self, Error> {
        let pc = dbg.thread_pc(thread)?;
        let frame = dbg.physical_frames(thread)?.into_iter().next();
        let function = dbg.symbols.function_at(pc);

        let range = match (dbg.symbols.line_at(pc), &function) {
            (Some(line), Some(function)) => StepRange::Range {
                start: function.low.min(line.start),
                end: line.end,
            },
            (Some(line), None) => StepRange::Range {
                start: line.start,
                end: line.end,
            },
            (None, Some(function)) => StepRange::Range {
                start: function.low,
                end: pc + 1,
            },
            (None, None) => return Err(Error::NoFunctionBounds),
        };

        let longjmp_bp = set_longjmp_guard(dbg, thread);
        let step_line = dbg.symbols.line_at(pc);
        let info = dbg.thread_mut(thread)?;
        info.inline_skipped = None;
        info.control = ThreadControl {
            step_range: Some(range),
            step_over_calls: StepOverCalls::All,
            step_frame_id: frame.map(|f| f.id),
            step_line,
            ..ThreadControl::default()
        };

        Ok(Self {
            common: FsmCommon::new(thread),
            longjmp_bp,
        })
    }

    pub(super) fn should_stop(&mut self, ev: &StopEvent) -> FsmVerdict {
        if ev.stop_step {
            self.common.finished = true;
        }
        FsmVerdict::Stop
    }

    pub(super) fn clean_up(&mut self, dbg: &mut Debugger) {
        if let Some(bp) = self.longjmp_bp.take() {
            dbg.breakpoints.discard(bp);
        }
    }
}

/// `until LOCATION` and `advance LOCATION`: run until the location is reached or the current
/// frame returns.
pub struct UntilBreakFsm {
    pub(super) common: FsmCommon,
    breakpoints: Vec<u32>,
}

impl UntilBreakFsm {
    /// With `anywhere` unset (`until`) the location stops the unit only in the current frame.
    pub fn prepare(
        dbg: &mut Debugger,
        thread: Ptid,
        location: CoreAddr,
        anywhere: bool,
    ) -> Result<Self, Error> {
        let pc = dbg.thread_pc(thread)?;
        let frames = dbg.physical_frames(thread)?;
        let mut breakpoints = vec![];

        let in_current_function = dbg
            .symbols
            .function_at(pc)
            .map(|f| f.contains(location))
            .unwrap_or(false);
        let location_frame = match frames.first() {
            Some(frame) if !anywhere && in_current_function => Some(frame.id),
            _ => None,
        };
        breakpoints.push(dbg.breakpoints.add_momentary(
            MomentaryKind::Until,
            location,
            thread,
            location_frame,
        ));

        if let Some(caller) = frames
            .iter()
            .skip(1)
            .find(|f| f.kind != FrameKind::TailCall)
        {
            breakpoints.push(dbg.breakpoints.add_momentary(
                MomentaryKind::Until,
                caller.pc,
                thread,
                Some(caller.id),
            ));
        }

        let info = dbg.thread_mut(thread)?;
        info.inline_skipped = None;
        info.control = ThreadControl::default();

        Ok(Self {
            common: FsmCommon::new(thread),
            breakpoints,
        })
    }

    pub(super) fn should_stop(&mut self, ev: &StopEvent) -> FsmVerdict {
        if ev.bpstat.iter().any(|bp| self.breakpoints.contains(bp)) {
            self.common.finished = true;
        }
        FsmVerdict::Stop
    }

    pub(super) fn clean_up(&mut self, dbg: &mut Debugger) {
        for bp in self.breakpoints.drain(..) {
            dbg.breakpoints.discard(bp);
        }
    }
}
