//! Execution-control state machines of multi-step commands.
//!
//! A machine is created (prepared) by a command, receives every stop of its unit through
//! [`ThreadFsm::should_stop`] until it decides to stop, then it is cleaned up exactly once and
//! [`ThreadFsm::classify`] tells why control returns to the user.

mod finish;
mod step;
mod until;

pub use finish::FinishFsm;
pub use step::StepFsm;
pub use until::{UntilBreakFsm, UntilNextFsm};

use crate::debugger::error::Error;
use crate::debugger::infrun::{StopEvent, StopReason};
use crate::debugger::ptid::Ptid;
use crate::debugger::Debugger;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsmVerdict {
    KeepGoing,
    Stop,
}

/// Result of a machine preparation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prepared {
    /// The unit must be resumed.
    Resume,
    /// The command completed without running the program (e.g. stepping into an inlined call).
    Done,
}

/// State shared by every machine.
#[derive(Clone, Copy, Debug)]
struct FsmCommon {
    thread: Ptid,
    finished: bool,
    cleaned_up: bool,
}

impl FsmCommon {
    fn new(thread: Ptid) -> Self {
        Self {
            thread,
            finished: false,
            cleaned_up: false,
        }
    }
}

pub enum ThreadFsm {
    Step(StepFsm),
    UntilNext(UntilNextFsm),
    UntilBreak(UntilBreakFsm),
    Finish(FinishFsm),
}

impl ThreadFsm {
    fn common(&self) -> &FsmCommon {
        match self {
            ThreadFsm::Step(fsm) => &fsm.common,
            ThreadFsm::UntilNext(fsm) => &fsm.common,
            ThreadFsm::UntilBreak(fsm) => &fsm.common,
            ThreadFsm::Finish(fsm) => &fsm.common,
        }
    }

    fn common_mut(&mut self) -> &mut FsmCommon {
        match self {
            ThreadFsm::Step(fsm) => &mut fsm.common,
            ThreadFsm::UntilNext(fsm) => &mut fsm.common,
            ThreadFsm::UntilBreak(fsm) => &mut fsm.common,
            ThreadFsm::Finish(fsm) => &mut fsm.common,
        }
    }

    /// Unit running under the command.
    pub fn thread(&self) -> Ptid {
        self.common().thread
    }

    pub fn finished(&self) -> bool {
        self.common().finished
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreadFsm::Step(_) => "step",
            ThreadFsm::UntilNext(_) => "until",
            ThreadFsm::UntilBreak(_) => "until-location",
            ThreadFsm::Finish(_) => "finish",
        }
    }

    /// Decide whether the stop ends the command.
    pub fn should_stop(&mut self, dbg: &mut Debugger, ev: &StopEvent) -> Result<FsmVerdict, Error> {
        match self {
            ThreadFsm::Step(fsm) => fsm.should_stop(dbg, ev),
            ThreadFsm::UntilNext(fsm) => Ok(fsm.should_stop(ev)),
            ThreadFsm::UntilBreak(fsm) => Ok(fsm.should_stop(ev)),
            ThreadFsm::Finish(fsm) => Ok(fsm.should_stop(dbg, ev)),
        }
    }

    /// Release everything the machine holds. Second and later calls do nothing.
    pub fn clean_up(&mut self, dbg: &mut Debugger) {
        if self.common().cleaned_up {
            return;
        }
        self.common_mut().cleaned_up = true;
        let thread = self.thread();
        match self {
            ThreadFsm::Step(fsm) => fsm.clean_up(dbg),
            ThreadFsm::UntilNext(fsm) => fsm.clean_up(dbg),
            ThreadFsm::UntilBreak(fsm) => fsm.clean_up(dbg),
            ThreadFsm::Finish(fsm) => fsm.clean_up(dbg),
        }
        dbg.clear_step_state(thread);
    }

    pub fn cleaned_up(&self) -> bool {
        self.common().cleaned_up
    }

    /// Reason of a normally finished command, `None` if the command was abandoned.
    pub fn classify(&self) -> Option<StopReason> {
        if !self.finished() {
            return None;
        }
        Some(match self {
            ThreadFsm::Step(_) | ThreadFsm::UntilNext(_) => StopReason::EndSteppingRange,
            ThreadFsm::UntilBreak(_) => StopReason::LocationReached,
            ThreadFsm::Finish(fsm) => StopReason::FunctionFinished(fsm.return_value().cloned()),
        })
    }
}
