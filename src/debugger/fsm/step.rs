use crate::debugger::breakpoint::MomentaryKind;
use crate::debugger::error::Error;
use crate::debugger::fsm::{FsmCommon, FsmVerdict, Prepared};
use crate::debugger::infrun::StopEvent;
use crate::debugger::ptid::Ptid;
use crate::debugger::thread::{StepOverCalls, StepRange, ThreadControl};
use crate::debugger::Debugger;
use crate::sd_debug;

/// `step`, `next`, `stepi` and `nexti` with a repeat count.
pub struct StepFsm {
    pub(super) common: FsmCommon,
    count: u32,
    /// Instruction stepping (`stepi`/`nexti`).
    single_inst: bool,
    /// Step over called functions (`next`/`nexti`).
    skip_subroutines: bool,
    longjmp_bp: Option<u32>,
}

/// Place the guard breakpoint on the non-local jump routine if the program has one.
pub(super) fn set_longjmp_guard(dbg: &mut Debugger, thread: Ptid) -> Option<u32> {
    let target = dbg.symbols.longjmp_target()?;
    Some(
        dbg.breakpoints
            .add_momentary(MomentaryKind::Longjmp, target, thread, None),
    )
}

impl StepFsm {
    pub fn prepare(
        dbg: &mut Debugger,
        thread: Ptid,
        count: u32,
        single_inst: bool,
        skip_subroutines: bool,
    ) -> Result<(Self, Prepared), Error> {
        let mut fsm = Self {
            common: FsmCommon::new(thread),
            count,
            single_inst,
            skip_subroutines,
            longjmp_bp: None,
        };
        if !single_inst {
            fsm.longjmp_bp = set_longjmp_guard(dbg, thread);
        }

        match fsm.prepare_one_step(dbg) {
            Ok(true) => Ok((fsm, Prepared::Resume)),
            Ok(false) => {
                fsm.common.finished = true;
                Ok((fsm, Prepared::Done))
            }
            Err(e) => {
                fsm.clean_up(dbg);
                dbg.clear_step_state(thread);
                Err(e)
            }
        }
    }

    /// Configure the unit for the next step. Return false if there is nothing left to step.
    fn prepare_one_step(&mut self, dbg: &mut Debugger) -> Result<bool, Error> {
        let thread = self.common.thread;
        while self.count > 0 {
            let pc = dbg.thread_pc(thread)?;
            let frame = dbg.physical_frames(thread)?.into_iter().next();

            let mut control = ThreadControl {
                step_frame_id: frame.map(|f| f.id),
                step_over_calls: if self.skip_subroutines {
                    StepOverCalls::All
                } else {
                    StepOverCalls::Undebuggable
                },
                ..ThreadControl::default()
            };

            if self.single_inst {
                if !self.skip_subroutines {
                    control.step_over_calls = StepOverCalls::None;
                }
                control.step_range = Some(StepRange::Instruction);
                let info = dbg.thread_mut(thread)?;
                info.control = control;
                return Ok(true);
            }

            let inline_skipped = dbg.thread_mut(thread)?.inline_skipped.clone();
            if let (Some(block), false) = (&inline_skipped, self.skip_subroutines) {
                // the unit is already at the first instruction of the inlined call,
                // entering it changes nothing but the frame view
                sd_debug!(target: "infrun", "step into inlined function {}", block.name);
                dbg.thread_mut(thread)?.inline_skipped = None;
                self.count -= 1;
                continue;
            }

            let line = dbg.symbols.line_at(pc);
            control.step_range = match (&line, &inline_skipped) {
                (Some(line), Some(block)) => Some(StepRange::Range {
                    start: line.start.min(block.low),
                    end: line.end.max(block.high),
                }),
                (Some(line), None) => Some(StepRange::Range {
                    start: line.start,
                    end: line.end,
                }),
                (None, _) if dbg.config.step_stop_if_no_debug => Some(StepRange::Instruction),
                (None, _) => {
                    let function = dbg
                        .symbols
                        .function_at(pc)
                        .ok_or(Error::NoFunctionBounds)?;
                    Some(StepRange::Range {
                        start: function.low,
                        end: function.high,
                    })
                }
            };
            control.step_line = line;

            let info = dbg.thread_mut(thread)?;
            info.inline_skipped = None;
            info.control = control;
            return Ok(true);
        }
        Ok(false)
    }

    pub(super) fn should_stop(
        &mut self,
        dbg: &mut Debugger,
        ev: &StopEvent,
    ) -> Result<FsmVerdict, Error> {
        if !ev.stop_step {
            return Ok(FsmVerdict::Stop);
        }
        self.count = self.count.saturating_sub(1);
        if self.count > 0 && self.prepare_one_step(dbg)? {
            return Ok(FsmVerdict::KeepGoing);
        }
        self.common.finished = true;
        Ok(FsmVerdict::Stop)
    }

    pub(super) fn clean_up(&mut self, dbg: &mut Debugger) {
        if let Some(bp) = self.longjmp_bp.take() {
            dbg.breakpoints.discard(bp);
        }
    }

    pub fn remaining(&self) -> u32 {
        self.count
    }
}
