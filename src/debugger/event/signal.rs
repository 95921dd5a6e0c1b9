//! The only part of the event loop reachable from a real signal handler.
//!
//! Everything here is async-signal-safe: marking a token stores into an atomic and writes one
//! byte into a non-blocking pipe, no allocation, no locks.

use crate::debugger::error::Error;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use os_pipe::{PipeReader, PipeWriter};
use signal_hook::SigId;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Self-pipe used to interrupt the event loop wait.
pub struct WakePipe {
    reader: PipeReader,
    writer: PipeWriter,
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Syscall("fcntl", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Syscall("fcntl", e))?;
    Ok(())
}

impl WakePipe {
    pub fn new() -> Result<Self, Error> {
        let (reader, writer) = os_pipe::pipe()?;
        set_nonblocking(reader.as_raw_fd())?;
        set_nonblocking(writer.as_raw_fd())?;
        Ok(Self { reader, writer })
    }

    /// Make the pipe readable. A full pipe is already readable, so errors are ignored.
    pub fn wake(&self) {
        _ = (&self.writer).write(&[1]);
    }

    /// Drain pending wake-ups.
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.reader).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    /// Read end, readable while some wake-up is pending.
    pub fn reader(&self) -> &PipeReader {
        &self.reader
    }
}

/// Ready flag of an async signal handler, safe to mark from signal context.
#[derive(Clone)]
pub struct SignalToken {
    ready: Arc<AtomicBool>,
    wake: Arc<WakePipe>,
}

impl SignalToken {
    pub(super) fn new(wake: Arc<WakePipe>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            wake,
        }
    }

    /// Request callback invocation at the next drain of the event loop.
    pub fn mark(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.wake.wake();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Clear the flag, return its previous value.
    pub(super) fn take(&self) -> bool {
        self.ready.swap(false, Ordering::SeqCst)
    }
}

/// Mark `token` every time the process receives `signal`.
pub fn install_handler(signal: i32, token: SignalToken) -> Result<SigId, Error> {
    // SAFETY: action only touches an atomic flag and a non-blocking pipe
    let id = unsafe { signal_hook::low_level::register(signal, move || token.mark()) }?;
    Ok(id)
}

pub fn uninstall_handler(id: SigId) -> bool {
    signal_hook::low_level::unregister(id)
}
