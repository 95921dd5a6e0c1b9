use crate::debugger::arch::FrameId;
use crate::debugger::error::Error;
use crate::debugger::ptid::Ptid;
use crate::debugger::CoreAddr;
use indexmap::IndexMap;
use strum_macros::Display;

/// Purpose of a breakpoint that removes itself once it served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum MomentaryKind {
    /// Return address of a function being finished.
    Finish,
    /// Resume point when stepping over (or out of) a subroutine.
    StepResume,
    /// Location of `until`/`advance`.
    Until,
    /// Guard against a non-local jump while stepping.
    Longjmp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    User,
    Momentary(MomentaryKind),
}

/// Breakpoint representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub number: u32,
    pub addr: CoreAddr,
    pub kind: BreakpointKind,
    /// Execution unit the breakpoint belongs to, `None` for all units.
    pub owner: Option<Ptid>,
    /// Breakpoint triggers only if the innermost frame is this one.
    pub frame: Option<FrameId>,
    pub enabled: bool,
    pub hit_count: u32,
}

impl Breakpoint {
    pub fn is_momentary(&self) -> bool {
        matches!(self.kind, BreakpointKind::Momentary(_))
    }

    pub fn momentary_kind(&self) -> Option<MomentaryKind> {
        match self.kind {
            BreakpointKind::Momentary(kind) => Some(kind),
            BreakpointKind::User => None,
        }
    }

    /// True if a stop of `ptid` at `pc` with innermost frame `frame` triggers this breakpoint.
    pub fn triggered_by(&self, ptid: Ptid, pc: CoreAddr, frame: Option<FrameId>) -> bool {
        if !self.enabled || self.addr != pc {
            return false;
        }
        if let Some(owner) = self.owner {
            if owner != ptid {
                return false;
            }
        }
        match self.frame {
            Some(expected) => frame == Some(expected),
            None => true,
        }
    }
}

/// All user and momentary breakpoints of a debugger.
///
/// The table only describes breakpoints, their instructions are written into the program by the
/// memory pipeline when execution resumes.
#[derive(Default)]
pub struct BreakpointTable {
    breakpoints: IndexMap<u32, Breakpoint>,
    next_user: u32,
    next_internal: u32,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user breakpoint, return its number.
    pub fn add_user(&mut self, addr: CoreAddr) -> u32 {
        self.next_user += 1;
        let number = self.next_user;
        self.breakpoints.insert(
            number,
            Breakpoint {
                number,
                addr,
                kind: BreakpointKind::User,
                owner: None,
                frame: None,
                enabled: true,
                hit_count: 0,
            },
        );
        number
    }

    /// Add a momentary breakpoint bound to a unit (and optionally to a frame).
    ///
    /// Internal breakpoints are numbered from `u32::MAX` down, so they never clash with user ones.
    pub fn add_momentary(
        &mut self,
        kind: MomentaryKind,
        addr: CoreAddr,
        owner: Ptid,
        frame: Option<FrameId>,
    ) -> u32 {
        self.next_internal += 1;
        let number = u32::MAX - self.next_internal;
        self.breakpoints.insert(
            number,
            Breakpoint {
                number,
                addr,
                kind: BreakpointKind::Momentary(kind),
                owner: Some(owner),
                frame,
                enabled: true,
                hit_count: 0,
            },
        );
        number
    }

    pub fn remove(&mut self, number: u32) -> Result<Breakpoint, Error> {
        self.breakpoints
            .shift_remove(&number)
            .ok_or(Error::BreakpointNotFound(number))
    }

    /// Remove a breakpoint if it still exists. Used by clean-up paths.
    pub fn discard(&mut self, number: u32) -> bool {
        self.breakpoints.shift_remove(&number).is_some()
    }

    /// Remove every momentary breakpoint owned by a unit of the process.
    pub fn discard_momentary_of(&mut self, pid: i32) {
        self.breakpoints
            .retain(|_, bp| !(bp.is_momentary() && bp.owner.map(|o| o.pid) == Some(pid)));
    }

    pub fn set_enabled(&mut self, number: u32, enabled: bool) -> Result<(), Error> {
        let bp = self
            .breakpoints
            .get_mut(&number)
            .ok_or(Error::BreakpointNotFound(number))?;
        bp.enabled = enabled;
        Ok(())
    }

    pub fn get(&self, number: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&number)
    }

    pub fn contains(&self, number: u32) -> bool {
        self.breakpoints.contains_key(&number)
    }

    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints
            .values()
            .filter(|bp| bp.kind == BreakpointKind::User)
    }

    /// Addresses that must hold a breakpoint instruction while the process runs.
    pub fn locations_for(&self, pid: i32) -> Vec<CoreAddr> {
        let mut addrs: Vec<_> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled && bp.owner.map(|o| o.pid == pid).unwrap_or(true))
            .map(|bp| bp.addr)
            .collect();
        addrs.sort_unstable();
        addrs.dedup();
        addrs
    }

    pub fn has_location(&self, addr: CoreAddr) -> bool {
        self.breakpoints
            .values()
            .any(|bp| bp.enabled && bp.addr == addr)
    }

    /// Breakpoints triggered by a stop, the hit counts of user breakpoints are incremented.
    pub fn stop_status(&mut self, ptid: Ptid, pc: CoreAddr, frame: Option<FrameId>) -> Vec<u32> {
        let mut hits = vec![];
        for bp in self.breakpoints.values_mut() {
            if bp.triggered_by(ptid, pc, frame) {
                if bp.kind == BreakpointKind::User {
                    bp.hit_count += 1;
                }
                hits.push(bp.number);
            }
        }
        hits
    }
}
