use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// When set, every partial memory transfer is logged with the `memory` target.
static TRACE_TRANSFERS: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

#[inline(always)]
pub fn transfers_traced() -> bool {
    is_enabled() && TRACE_TRANSFERS.load(Ordering::Relaxed)
}

pub fn trace_transfers(on: bool) {
    TRACE_TRANSFERS.store(on, Ordering::Relaxed)
}

/// Silence the crate logs until the guard is dropped.
pub struct MuteGuard {
    was_enabled: bool,
}

impl MuteGuard {
    pub fn new() -> Self {
        let was_enabled = is_enabled();
        disable();
        Self { was_enabled }
    }
}

impl Default for MuteGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable();
        }
    }
}

#[macro_export]
macro_rules! sd_info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::info!(target: $target, $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! sd_warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::warn!(target: $target, $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! sd_debug {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::debug!(target: $target, $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! sd_trace {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::trace!(target: $target, $($arg)+)
        }
    };
}
