//! Deferred event dispatcher.
//!
//! Real signal handlers only mark a [`SignalToken`]. Callbacks run later, from the main loop,
//! when the loop drains its registries:
//! * async signal handlers: all ready handlers, repeatedly, until none is ready,
//! * async event handlers: the first ready one only,
//! * expired timers and ready file descriptors.

pub mod signal;

pub use signal::{install_handler, uninstall_handler, SignalToken, WakePipe};

use crate::debugger::error::Error;
use crate::{sd_debug, sd_trace};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::cell::RefCell;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Context given to callbacks.
pub trait DispatchContext {
    /// Make the primary front end current. Called before every async signal handler since such
    /// handlers are not owned by any front end.
    fn switch_to_primary(&mut self);
}

type Callback<C> = Rc<RefCell<dyn FnMut(&mut C)>>;

macro_rules! handler_id {
    ($name: ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(u64);
    };
}

handler_id!(AsyncSignalHandlerId);
handler_id!(AsyncEventHandlerId);
handler_id!(TimerId);
handler_id!(FileHandlerId);

/// Created async signal handler.
#[derive(Clone)]
pub struct AsyncSignalHandler {
    pub id: AsyncSignalHandlerId,
    /// Token for marking from signal context.
    pub token: SignalToken,
}

struct SignalEntry<C> {
    id: AsyncSignalHandlerId,
    name: &'static str,
    token: SignalToken,
    callback: Callback<C>,
}

struct EventEntry<C> {
    id: AsyncEventHandlerId,
    name: &'static str,
    ready: bool,
    callback: Callback<C>,
}

struct TimerEntry<C> {
    id: TimerId,
    deadline: Instant,
    callback: Callback<C>,
}

struct FileEntry<C> {
    id: FileHandlerId,
    fd: OwnedFd,
    callback: Callback<C>,
}

struct Registries<C> {
    signals: Vec<SignalEntry<C>>,
    events: Vec<EventEntry<C>>,
    timers: Vec<TimerEntry<C>>,
    files: Vec<FileEntry<C>>,
    next_id: u64,
}

impl<C> Registries<C> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Handle to the event loop. Clones share the same registries.
pub struct EventLoop<C> {
    inner: Rc<RefCell<Registries<C>>>,
    wake: Arc<WakePipe>,
}

impl<C> Clone for EventLoop<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            wake: self.wake.clone(),
        }
    }
}

/// Milliseconds for poll(2), rounded up, `-1` waits forever.
fn poll_timeout(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
    }
}

fn invoke<C>(callback: &Callback<C>, ctx: &mut C, name: &str) {
    match callback.try_borrow_mut() {
        Ok(mut cb) => (&mut *cb)(ctx),
        Err(_) => sd_debug!(target: "event-loop", "skip reentrant invocation of \"{name}\""),
    }
}

impl<C: DispatchContext> EventLoop<C> {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            inner: Rc::new(RefCell::new(Registries {
                signals: vec![],
                events: vec![],
                timers: vec![],
                files: vec![],
                next_id: 0,
            })),
            wake: Arc::new(WakePipe::new()?),
        })
    }

    // --------------------------------- async signal handlers -------------------------------------

    pub fn create_async_signal_handler(
        &self,
        name: &'static str,
        callback: impl FnMut(&mut C) + 'static,
    ) -> AsyncSignalHandler {
        let mut regs = self.inner.borrow_mut();
        let id = AsyncSignalHandlerId(regs.next_id());
        let token = SignalToken::new(self.wake.clone());
        regs.signals.push(SignalEntry {
            id,
            name,
            token: token.clone(),
            callback: Rc::new(RefCell::new(callback)),
        });
        AsyncSignalHandler { id, token }
    }

    /// Main loop side of [`SignalToken::mark`].
    pub fn mark_async_signal_handler(&self, id: AsyncSignalHandlerId) {
        let regs = self.inner.borrow();
        if let Some(entry) = regs.signals.iter().find(|e| e.id == id) {
            entry.token.mark();
        }
    }

    pub fn async_signal_handler_ready(&self, id: AsyncSignalHandlerId) -> bool {
        self.inner
            .borrow()
            .signals
            .iter()
            .any(|e| e.id == id && e.token.is_ready())
    }

    /// Unlink a handler, pending invocation is dropped.
    pub fn delete_async_signal_handler(&self, id: AsyncSignalHandlerId) -> bool {
        let mut regs = self.inner.borrow_mut();
        let before = regs.signals.len();
        regs.signals.retain(|e| e.id != id);
        before != regs.signals.len()
    }

    /// Run every ready async signal handler, including handlers marked while draining.
    /// Return true if at least one handler ran.
    pub fn invoke_async_signal_handlers(&self, ctx: &mut C) -> bool {
        self.wake.clear();

        let mut invoked = false;
        loop {
            let next = {
                let regs = self.inner.borrow();
                regs.signals
                    .iter()
                    .find(|e| e.token.take())
                    .map(|e| (e.name, e.callback.clone()))
            };
            let Some((name, callback)) = next else {
                break;
            };
            sd_trace!(target: "event-loop", "invoke async signal handler \"{name}\"");
            ctx.switch_to_primary();
            invoke(&callback, ctx, name);
            invoked = true;
        }
        invoked
    }

    // --------------------------------- async event handlers --------------------------------------

    pub fn create_async_event_handler(
        &self,
        name: &'static str,
        callback: impl FnMut(&mut C) + 'static,
    ) -> AsyncEventHandlerId {
        let mut regs = self.inner.borrow_mut();
        let id = AsyncEventHandlerId(regs.next_id());
        regs.events.push(EventEntry {
            id,
            name,
            ready: false,
            callback: Rc::new(RefCell::new(callback)),
        });
        id
    }

    pub fn mark_async_event_handler(&self, id: AsyncEventHandlerId) {
        self.set_event_ready(id, true)
    }

    pub fn clear_async_event_handler(&self, id: AsyncEventHandlerId) {
        self.set_event_ready(id, false)
    }

    fn set_event_ready(&self, id: AsyncEventHandlerId, ready: bool) {
        if let Some(entry) = self
            .inner
            .borrow_mut()
            .events
            .iter_mut()
            .find(|e| e.id == id)
        {
            entry.ready = ready;
        }
    }

    pub fn async_event_handler_ready(&self, id: AsyncEventHandlerId) -> bool {
        self.inner
            .borrow()
            .events
            .iter()
            .any(|e| e.id == id && e.ready)
    }

    pub fn delete_async_event_handler(&self, id: AsyncEventHandlerId) -> bool {
        let mut regs = self.inner.borrow_mut();
        let before = regs.events.len();
        regs.events.retain(|e| e.id != id);
        before != regs.events.len()
    }

    /// Run the first ready async event handler. Return true if a handler ran.
    pub fn check_async_event_handlers(&self, ctx: &mut C) -> bool {
        let next = {
            let mut regs = self.inner.borrow_mut();
            regs.events.iter_mut().find(|e| e.ready).map(|e| {
                e.ready = false;
                (e.name, e.callback.clone())
            })
        };
        match next {
            Some((name, callback)) => {
                sd_trace!(target: "event-loop", "invoke async event handler \"{name}\"");
                invoke(&callback, ctx, name);
                true
            }
            None => false,
        }
    }

    // --------------------------------- timers and files ------------------------------------------

    pub fn create_timer(
        &self,
        after: Duration,
        callback: impl FnMut(&mut C) + 'static,
    ) -> TimerId {
        let mut regs = self.inner.borrow_mut();
        let id = TimerId(regs.next_id());
        regs.timers.push(TimerEntry {
            id,
            deadline: Instant::now() + after,
            callback: Rc::new(RefCell::new(callback)),
        });
        id
    }

    pub fn delete_timer(&self, id: TimerId) -> bool {
        let mut regs = self.inner.borrow_mut();
        let before = regs.timers.len();
        regs.timers.retain(|t| t.id != id);
        before != regs.timers.len()
    }

    /// Watch `fd` for readability. The loop keeps its own duplicate of the descriptor.
    pub fn add_file_handler(
        &self,
        fd: impl AsFd,
        callback: impl FnMut(&mut C) + 'static,
    ) -> Result<FileHandlerId, Error> {
        let fd = fd.as_fd().try_clone_to_owned()?;
        let mut regs = self.inner.borrow_mut();
        let id = FileHandlerId(regs.next_id());
        regs.files.push(FileEntry {
            id,
            fd,
            callback: Rc::new(RefCell::new(callback)),
        });
        Ok(id)
    }

    pub fn delete_file_handler(&self, id: FileHandlerId) -> bool {
        let mut regs = self.inner.borrow_mut();
        let before = regs.files.len();
        regs.files.retain(|f| f.id != id);
        before != regs.files.len()
    }

    /// Run expired timers (each timer fires once). Return true if some timer fired.
    fn run_expired_timers(&self, ctx: &mut C) -> bool {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut regs = self.inner.borrow_mut();
            let (expired, rest): (Vec<_>, Vec<_>) =
                regs.timers.drain(..).partition(|t| t.deadline <= now);
            regs.timers = rest;
            expired
        };
        let fired = !expired.is_empty();
        for timer in expired {
            invoke(&timer.callback, ctx, "timer");
        }
        fired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow().timers.iter().map(|t| t.deadline).min()
    }

    /// Block until some async signal handler is marked or `timeout` expires. Return true if the
    /// loop was woken up.
    pub fn wait_for_wake(&self, timeout: Duration) -> Result<bool, Error> {
        let mut fds = [PollFd::new(self.wake.reader(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(Some(timeout))) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(true),
            Err(e) => Err(Error::Syscall("poll", e)),
        }
    }

    /// Block until the wake pipe or some registered descriptor is readable, or `timeout` expires
    /// (`None` waits forever). Return ready file handlers.
    pub fn wait_for_activity(&self, timeout: Option<Duration>) -> Result<Vec<FileHandlerId>, Error> {
        let regs = self.inner.borrow();

        let mut fds = Vec::with_capacity(regs.files.len() + 1);
        fds.push(PollFd::new(self.wake.reader(), PollFlags::POLLIN));
        fds.extend(regs.files.iter().map(|f| PollFd::new(&f.fd, PollFlags::POLLIN)));

        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(vec![]),
            Err(e) => return Err(Error::Syscall("poll", e)),
        }

        Ok(regs
            .files
            .iter()
            .zip(fds.iter().skip(1))
            .filter(|(_, pfd)| pfd.revents().map_or(false, |r| !r.is_empty()))
            .map(|(f, _)| f.id)
            .collect())
    }

    /// Run one pass of the loop. With `block` set, wait for something to happen if nothing is
    /// ready. Return true if some callback ran.
    pub fn do_one_event(&self, ctx: &mut C, block: bool) -> Result<bool, Error> {
        if self.invoke_async_signal_handlers(ctx) {
            return Ok(true);
        }
        if self.check_async_event_handlers(ctx) {
            return Ok(true);
        }
        if self.run_expired_timers(ctx) {
            return Ok(true);
        }

        let timeout = match (block, self.next_deadline()) {
            (false, _) => Some(Duration::ZERO),
            (true, Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
            (true, None) => None,
        };
        let ready_files = self.wait_for_activity(timeout)?;

        let mut ran = self.invoke_async_signal_handlers(ctx);
        for id in ready_files {
            let callback = {
                let regs = self.inner.borrow();
                regs.files
                    .iter()
                    .find(|f| f.id == id)
                    .map(|f| f.callback.clone())
            };
            if let Some(callback) = callback {
                invoke(&callback, ctx, "file handler");
                ran = true;
            }
        }
        ran |= self.run_expired_timers(ctx);
        Ok(ran)
    }
}
