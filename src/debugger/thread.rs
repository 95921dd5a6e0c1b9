use crate::debugger::arch::FrameId;
use crate::debugger::fsm::ThreadFsm;
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::symbols::{InlineBlock, LineRange};
use crate::debugger::CoreAddr;
use indexmap::IndexMap;
use nix::sys::signal::Signal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Stopped,
    Running,
    Exited,
}

/// Code range that keeps a unit stepping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepRange {
    /// Stop after a single instruction.
    Instruction,
    /// Keep stepping while `start <= pc < end`.
    Range { start: CoreAddr, end: CoreAddr },
}

impl StepRange {
    pub fn contains(&self, pc: CoreAddr) -> bool {
        match self {
            StepRange::Instruction => false,
            StepRange::Range { start, end } => pc >= *start && pc < *end,
        }
    }
}

/// What to do when stepping enters a subroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOverCalls {
    /// Step over functions without line information only.
    Undebuggable,
    All,
    /// Stop in the first instruction of any called function.
    None,
}

/// Stepping state of a unit, configured by a command and consulted by every stop.
#[derive(Clone, Debug)]
pub struct ThreadControl {
    pub step_range: Option<StepRange>,
    pub step_over_calls: StepOverCalls,
    /// Physical frame the stepping started in.
    pub step_frame_id: Option<FrameId>,
    pub step_line: Option<LineRange>,
    /// Stop as soon as the step range is left, ignoring line boundaries.
    pub stop_on_exit: bool,
    pub step_resume_bp: Option<u32>,
}

impl Default for ThreadControl {
    fn default() -> Self {
        Self {
            step_range: None,
            step_over_calls: StepOverCalls::Undebuggable,
            step_frame_id: None,
            step_line: None,
            stop_on_exit: false,
            step_resume_bp: None,
        }
    }
}

impl ThreadControl {
    pub fn is_stepping(&self) -> bool {
        self.step_range.is_some()
    }
}

/// Execution unit known to the debugger.
pub struct ThreadInfo {
    pub ptid: Ptid,
    /// User visible number, unique within a debugger.
    pub num: u32,
    pub state: ThreadState,
    pub control: ThreadControl,
    /// Signal to deliver when the unit resumes.
    pub stop_signal: Option<Signal>,
    /// Interrupt was requested and not yet observed.
    pub stop_requested: bool,
    /// Multi-step command in progress.
    pub fsm: Option<ThreadFsm>,
    pub stop_pc: Option<CoreAddr>,
    /// Inlined call whose frame is hidden, the unit is at its very first instruction.
    pub inline_skipped: Option<InlineBlock>,
    pub regcache: Option<RegisterCache>,
}

impl ThreadInfo {
    pub fn new(ptid: Ptid, num: u32) -> Self {
        Self {
            ptid,
            num,
            state: ThreadState::Stopped,
            control: ThreadControl::default(),
            stop_signal: None,
            stop_requested: false,
            fsm: None,
            stop_pc: None,
            inline_skipped: None,
            regcache: None,
        }
    }
}

/// Units of an inferior in creation order.
#[derive(Default)]
pub struct ThreadList {
    threads: IndexMap<Ptid, ThreadInfo>,
}

impl ThreadList {
    /// Add a unit if it is not known yet. Return true if it was added.
    pub fn add(&mut self, ptid: Ptid, num: u32) -> bool {
        if self.threads.contains_key(&ptid) {
            return false;
        }
        self.threads.insert(ptid, ThreadInfo::new(ptid, num));
        true
    }

    pub fn remove(&mut self, ptid: Ptid) -> Option<ThreadInfo> {
        self.threads.shift_remove(&ptid)
    }

    pub fn get(&self, ptid: Ptid) -> Option<&ThreadInfo> {
        self.threads.get(&ptid)
    }

    pub fn get_mut(&mut self, ptid: Ptid) -> Option<&mut ThreadInfo> {
        self.threads.get_mut(&ptid)
    }

    pub fn contains(&self, ptid: Ptid) -> bool {
        self.threads.contains_key(&ptid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadInfo> {
        self.threads.values_mut()
    }

    pub fn ptids(&self) -> Vec<Ptid> {
        self.threads.keys().copied().collect()
    }

    pub fn first(&self) -> Option<Ptid> {
        self.threads.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn clear(&mut self) {
        self.threads.clear()
    }

    /// Drop cached registers of every unit.
    pub fn invalidate_registers(&mut self) {
        self.threads.values_mut().for_each(|t| t.regcache = None);
    }
}
