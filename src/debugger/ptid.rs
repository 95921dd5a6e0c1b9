use std::fmt::{Display, Formatter};

/// Execution unit identity: a process, a physical thread (lwp) of a process or a virtual task
/// scheduled on top of physical threads.
///
/// `lwp == 0 && tid == 0` identifies a whole process, `tid != 0` identifies a virtual unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptid {
    pub pid: i32,
    pub lwp: i64,
    pub tid: u64,
}

impl Ptid {
    /// Wildcard matching every execution unit of every process.
    pub const ANY: Ptid = Ptid {
        pid: -1,
        lwp: 0,
        tid: 0,
    };

    /// Matches nothing, used as "no thread" marker.
    pub const NULL: Ptid = Ptid {
        pid: 0,
        lwp: 0,
        tid: 0,
    };

    pub const fn new(pid: i32, lwp: i64, tid: u64) -> Self {
        Self { pid, lwp, tid }
    }

    /// Identity of a whole process (matches all its units).
    pub const fn from_pid(pid: i32) -> Self {
        Self { pid, lwp: 0, tid: 0 }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// True if identity names a whole process.
    pub fn is_process(&self) -> bool {
        self.pid > 0 && self.lwp == 0 && self.tid == 0
    }

    /// True if identity names a virtual unit (task).
    pub fn is_virtual(&self) -> bool {
        self.tid != 0
    }

    /// Identity of the process this unit belongs to.
    pub fn process(&self) -> Ptid {
        Ptid::from_pid(self.pid)
    }

    /// Return true if `self` is selected by the `filter`. Filter may be `ANY`, a whole process or
    /// an exact unit.
    pub fn matches(&self, filter: Ptid) -> bool {
        if filter.is_any() {
            return true;
        }
        if filter.is_process() {
            return self.pid == filter.pid;
        }
        *self == filter
    }
}

impl Display for Ptid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_any() {
            return f.write_str("all");
        }
        if self.tid != 0 {
            write!(f, "Task {:#x}", self.tid)
        } else if self.lwp != 0 {
            write!(f, "Thread {}.{}", self.pid, self.lwp)
        } else {
            write!(f, "process {}", self.pid)
        }
    }
}
