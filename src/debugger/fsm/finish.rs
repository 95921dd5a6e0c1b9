use crate::debugger::arch::{FrameInfo, FrameKind, ReturnValue};
use crate::debugger::breakpoint::MomentaryKind;
use crate::debugger::error::Error;
use crate::debugger::fsm::{FsmCommon, FsmVerdict};
use crate::debugger::infrun::StopEvent;
use crate::debugger::ptid::Ptid;
use crate::debugger::symbols::FunctionBounds;
use crate::debugger::target::ExecDirection;
use crate::debugger::thread::{StepOverCalls, StepRange, ThreadControl};
use crate::debugger::Debugger;
use crate::{sd_debug, weak_error};

enum FinishMode {
    /// Momentary breakpoint at the caller resume address.
    Return {
        breakpoint: u32,
        function: Option<FunctionBounds>,
    },
    /// Step out of an inlined call, there is no return address to break on.
    Inline,
    /// Run backward to the call site.
    Reverse,
}

/// `finish`: run until the selected function returns.
pub struct FinishFsm {
    pub(super) common: FsmCommon,
    mode: FinishMode,
    return_value: Option<ReturnValue>,
}

/// Frame the caller breakpoint is bound to: the first physical frame at or after `from`.
fn binding_frame(frames: &[FrameInfo], from: usize) -> Option<&FrameInfo> {
    frames[from..].iter().find(|f| f.kind != FrameKind::Inline)
}

impl FinishFsm {
    pub fn prepare(dbg: &mut Debugger, thread: Ptid) -> Result<Self, Error> {
        let frames = dbg.frames(thread)?;
        let current = frames
            .first()
            .ok_or_else(|| Error::Unwind("no frames".to_string()))?;
        let physical = binding_frame(&frames, 0).map(|f| f.id);
        let common = FsmCommon::new(thread);

        if dbg.direction == ExecDirection::Reverse {
            let function = dbg
                .symbols
                .function_at(current.pc)
                .ok_or(Error::NoFunctionBounds)?;
            let mut control = ThreadControl {
                step_range: Some(StepRange::Instruction),
                step_over_calls: StepOverCalls::All,
                step_frame_id: physical,
                ..ThreadControl::default()
            };
            if current.pc != function.low {
                control.step_resume_bp = Some(dbg.breakpoints.add_momentary(
                    MomentaryKind::StepResume,
                    function.low,
                    thread,
                    physical,
                ));
            }
            let info = dbg.thread_mut(thread)?;
            info.inline_skipped = None;
            info.control = control;
            return Ok(Self {
                common,
                mode: FinishMode::Reverse,
                return_value: None,
            });
        }

        if current.kind == FrameKind::Inline {
            let Some(block) = current.function.clone() else {
                return Err(Error::NoFunctionBounds);
            };
            sd_debug!(target: "infrun", "finish out of inlined function {}", block.name);
            let info = dbg.thread_mut(thread)?;
            info.control = ThreadControl {
                step_range: Some(StepRange::Range {
                    start: block.low,
                    end: block.high,
                }),
                step_over_calls: StepOverCalls::All,
                step_frame_id: physical,
                stop_on_exit: true,
                ..ThreadControl::default()
            };
            return Ok(Self {
                common,
                mode: FinishMode::Inline,
                return_value: None,
            });
        }

        let caller_idx = frames
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, f)| f.kind != FrameKind::TailCall && f.writable)
            .map(|(idx, _)| idx)
            .ok_or(Error::OutermostFrame)?;
        let caller = &frames[caller_idx];
        let bind = binding_frame(&frames, caller_idx).map(|f| f.id);
        let breakpoint =
            dbg.breakpoints
                .add_momentary(MomentaryKind::Finish, caller.pc, thread, bind);
        sd_debug!(
            target: "infrun",
            "finish: run till exit to {:#x} (frame #{})",
            caller.pc,
            caller.level
        );

        let info = dbg.thread_mut(thread)?;
        info.control = ThreadControl::default();
        Ok(Self {
            common,
            mode: FinishMode::Return {
                breakpoint,
                function: current.function.clone(),
            },
            return_value: None,
        })
    }

    pub(super) fn should_stop(&mut self, dbg: &mut Debugger, ev: &StopEvent) -> FsmVerdict {
        match &self.mode {
            FinishMode::Return {
                breakpoint,
                function,
            } => {
                if ev.bpstat.contains(breakpoint) {
                    self.common.finished = true;
                    if let Some(function) = function {
                        self.return_value = weak_error!(
                            dbg.function_return_value(ev.ptid, function),
                            "capture return value:"
                        )
                        .flatten();
                    }
                }
            }
            FinishMode::Inline | FinishMode::Reverse => {
                if ev.stop_step {
                    self.common.finished = true;
                }
            }
        }
        FsmVerdict::Stop
    }

    pub(super) fn clean_up(&mut self, dbg: &mut Debugger) {
        if let FinishMode::Return { breakpoint, .. } = self.mode {
            dbg.breakpoints.discard(breakpoint);
        }
    }

    pub fn return_value(&self) -> Option<&ReturnValue> {
        self.return_value.as_ref()
    }
}
