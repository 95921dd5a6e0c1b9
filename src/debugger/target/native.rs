//! Native process layer, controls local processes with `ptrace`.
//!
//! Execution units are kernel threads, identified as `(pid, lwp, 0)`. The layer keeps all-stop
//! semantic: when an event is reported all other units of the process are stopped, events
//! observed while stopping them are queued and reported by later `wait` calls.

use crate::debugger::error::{Error, TransferError};
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::target::{
    Beneath, ExecDirection, ResumeRequest, Stratum, Target, TargetObject, Transfer,
    TransferRequest, WaitOptions, WaitStatus,
};
use crate::debugger::CoreAddr;
use crate::{sd_debug, sd_trace, weak_error};
use nix::errno::Errno;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::{Event, Options};
use nix::sys::signal::{Signal, SIGKILL, SIGSTOP, SIGTRAP};
use nix::sys::uio::{self, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus as PidStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::c_void;
use std::io::IoSliceMut;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use std::thread;
use sysinfo::{RefreshKind, System};

/// `si_code` of a trap raised by a breakpoint instruction.
const SI_KERNEL: i32 = 0x80;
const TRAP_BRKPT: i32 = 1;

const WORD: usize = std::mem::size_of::<u64>();

/// Pause between polls of a blocking `wait`.
const WAIT_POLL: Duration = Duration::from_millis(1);

fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT)
}

#[derive(Default, Debug)]
struct Lwp {
    running: bool,
    /// Interrupted by a user stop request, the stop is reported as `SIGSTOP`.
    interrupt_requested: bool,
    /// Interrupted to keep the all-stop invariant, the stop is not reported.
    stopping: bool,
    /// Interrupt was sent but the unit stopped for another reason first. The late interrupt stop
    /// must be swallowed.
    stale_interrupt: bool,
    stopped_by_breakpoint: bool,
}

/// What happened to a unit after a `waitpid` status was processed.
enum Observed {
    Report(Ptid, WaitStatus),
    /// Unit stopped silently.
    Stopped,
    /// Event handled internally, unit resumed or gone.
    Ignored,
}

#[derive(Default)]
pub struct NativeTarget {
    pid: Option<Pid>,
    lwps: BTreeMap<i32, Lwp>,
    pending: VecDeque<(Ptid, WaitStatus)>,
    /// The last resume let the whole process run, new threads follow it.
    process_running: bool,
}

impl NativeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn pid(&self) -> Result<Pid, Error> {
        self.pid.ok_or(Error::NoProcess)
    }

    fn ptid(&self, tid: Pid) -> Ptid {
        let pid = self.pid.map(Pid::as_raw).unwrap_or(tid.as_raw());
        Ptid::new(pid, tid.as_raw() as i64, 0)
    }

    /// Kernel thread behind a unit identity. A whole process maps to its main thread.
    fn lwp_of(&self, ptid: Ptid) -> Result<Pid, Error> {
        let pid = self.pid()?;
        if ptid.pid != pid.as_raw() {
            return Err(Error::ThreadNotFound(ptid));
        }
        let tid = if ptid.lwp == 0 {
            pid.as_raw()
        } else {
            ptid.lwp as i32
        };
        if !self.lwps.contains_key(&tid) {
            return Err(Error::ThreadNotFound(ptid));
        }
        Ok(Pid::from_raw(tid))
    }

    fn cont(&mut self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::cont(tid, signal).map_err(Error::Ptrace)?;
        if let Some(lwp) = self.lwps.get_mut(&tid.as_raw()) {
            lwp.running = true;
            lwp.stopped_by_breakpoint = false;
        }
        Ok(())
    }

    fn stopped(&mut self, tid: Pid) -> Option<&mut Lwp> {
        let lwp = self.lwps.get_mut(&tid.as_raw())?;
        lwp.running = false;
        Some(lwp)
    }

    /// Start tracing a thread created by a traced one. The new thread starts with a
    /// `PTRACE_EVENT_STOP` that may or may not be consumed yet.
    fn adopt(&mut self, tid: Pid) -> Result<(), Error> {
        if !self.lwps.contains_key(&tid.as_raw()) {
            sd_debug!(target: "native", "new thread {tid}");
            let status = waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(Error::Waitpid)?;
            sd_trace!(target: "native", "new thread {tid} initial status: {status:?}");
            self.lwps.insert(tid.as_raw(), Lwp::default());
        }
        if self.process_running {
            self.cont(tid, None)?;
        }
        Ok(())
    }

    fn observe(&mut self, status: PidStatus) -> Result<Observed, Error> {
        sd_trace!(target: "native", "waitpid: {status:?}");
        let pid = self.pid()?;
        let observed = match status {
            PidStatus::Exited(tid, code) => {
                if tid == pid {
                    self.lwps.clear();
                    Observed::Report(Ptid::from_pid(pid.as_raw()), WaitStatus::Exited(code))
                } else {
                    self.lwps.remove(&tid.as_raw());
                    Observed::Report(self.ptid(tid), WaitStatus::ThreadExited)
                }
            }
            PidStatus::Signaled(tid, signal, _) => {
                if tid == pid {
                    self.lwps.clear();
                    Observed::Report(Ptid::from_pid(pid.as_raw()), WaitStatus::Signalled(signal))
                } else {
                    self.lwps.remove(&tid.as_raw());
                    Observed::Report(self.ptid(tid), WaitStatus::ThreadExited)
                }
            }
            PidStatus::PtraceEvent(tid, signal, code) => {
                if !self.lwps.contains_key(&tid.as_raw()) {
                    // initial stop of a clone child observed before the parent clone event
                    self.lwps.insert(tid.as_raw(), Lwp::default());
                    if self.process_running {
                        self.cont(tid, None)?;
                    }
                    return Ok(Observed::Ignored);
                }
                self.observe_event(tid, signal, code)?
            }
            PidStatus::Stopped(tid, signal) => {
                let by_breakpoint = signal == SIGTRAP
                    && sys::ptrace::getsiginfo(tid)
                        .map(|info| info.si_code == SI_KERNEL || info.si_code == TRAP_BRKPT)
                        .unwrap_or(false);
                let ptid = self.ptid(tid);
                match self.stopped(tid) {
                    Some(lwp) => {
                        lwp.stopped_by_breakpoint = by_breakpoint;
                        if lwp.stopping {
                            lwp.stopping = false;
                            lwp.stale_interrupt = true;
                        }
                        if lwp.interrupt_requested {
                            lwp.interrupt_requested = false;
                            lwp.stale_interrupt = true;
                        }
                        Observed::Report(ptid, WaitStatus::Stopped(signal))
                    }
                    None => Observed::Ignored,
                }
            }
            other => {
                sd_debug!(target: "native", "unexpected waitpid status: {other:?}");
                Observed::Ignored
            }
        };
        Ok(observed)
    }

    fn observe_event(&mut self, tid: Pid, signal: Signal, code: i32) -> Result<Observed, Error> {
        if code == Event::PTRACE_EVENT_CLONE as i32 {
            let new_tid = sys::ptrace::getevent(tid).map_err(Error::Ptrace)? as i32;
            self.adopt(Pid::from_raw(new_tid))?;
            return self.restart_after_event(tid);
        }
        if code == Event::PTRACE_EVENT_EXIT as i32 || code == Event::PTRACE_EVENT_EXEC as i32 {
            return self.restart_after_event(tid);
        }
        if code != Event::PTRACE_EVENT_STOP as i32 {
            sd_debug!(target: "native", "{tid}: unexpected ptrace event {code}");
            return self.restart_after_event(tid);
        }

        let ptid = self.ptid(tid);
        let Some(lwp) = self.lwps.get_mut(&tid.as_raw()) else {
            return Ok(Observed::Ignored);
        };
        if lwp.stale_interrupt {
            lwp.stale_interrupt = false;
            self.cont(tid, None)?;
            return Ok(Observed::Ignored);
        }
        if lwp.stopping {
            lwp.stopping = false;
            lwp.running = false;
            if lwp.interrupt_requested {
                lwp.interrupt_requested = false;
                return Ok(Observed::Report(ptid, WaitStatus::Stopped(SIGSTOP)));
            }
            return Ok(Observed::Stopped);
        }
        if lwp.interrupt_requested {
            lwp.interrupt_requested = false;
            lwp.running = false;
            return Ok(Observed::Report(ptid, WaitStatus::Stopped(SIGSTOP)));
        }
        // group-stop or an interrupt nobody waits for
        sd_trace!(target: "native", "{tid}: swallow stop ({signal})");
        self.cont(tid, None)?;
        Ok(Observed::Ignored)
    }

    /// Resume a unit stopped at an event the debugger does not report. Pending interrupts stay
    /// pending and stop the unit again.
    fn restart_after_event(&mut self, tid: Pid) -> Result<Observed, Error> {
        let running = self
            .lwps
            .get(&tid.as_raw())
            .map(|lwp| lwp.running || lwp.stopping)
            .unwrap_or(false);
        if running {
            self.cont(tid, None)?;
            return Ok(Observed::Ignored);
        }
        self.stopped(tid);
        Ok(Observed::Stopped)
    }

    /// Stop every running unit. Events observed meanwhile are queued.
    fn stop_all(&mut self) -> Result<(), Error> {
        let running: Vec<i32> = self
            .lwps
            .iter()
            .filter(|(_, lwp)| lwp.running)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in &running {
            if let Err(e) = sys::ptrace::interrupt(Pid::from_raw(*tid)) {
                sd_debug!(target: "native", "interrupt {tid}: {e}");
                continue;
            }
            if let Some(lwp) = self.lwps.get_mut(tid) {
                lwp.stopping = true;
            }
        }

        for tid in running {
            while self.lwps.get(&tid).map(|lwp| lwp.running).unwrap_or(false) {
                let status = match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL)) {
                    Ok(status) => status,
                    Err(Errno::ECHILD) => {
                        self.lwps.remove(&tid);
                        break;
                    }
                    Err(e) => return Err(Error::Waitpid(e)),
                };
                if let Observed::Report(ptid, status) = self.observe(status)? {
                    self.pending.push_back((ptid, status));
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let tids: Vec<i32> = self.lwps.keys().copied().collect();
        for tid in tids {
            let status = match waitpid(
                Pid::from_raw(tid),
                Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG),
            ) {
                Ok(PidStatus::StillAlive) => continue,
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    self.lwps.remove(&tid);
                    continue;
                }
                Err(e) => return Err(Error::Waitpid(e)),
            };
            if let Observed::Report(ptid, status) = self.observe(status)? {
                return Ok(Some((ptid, status)));
            }
        }
        Ok(None)
    }

    fn forget(&mut self) {
        self.pid = None;
        self.lwps.clear();
        self.pending.clear();
        self.process_running = false;
    }

    fn read_words(&self, pid: Pid, addr: CoreAddr, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let aligned = cur & !(WORD as u64 - 1);
            let Ok(word) = sys::ptrace::read(pid, aligned as *mut c_void) else {
                break;
            };
            let bytes = (word as u64).to_ne_bytes();
            let skip = (cur - aligned) as usize;
            let len = (WORD - skip).min(buf.len() - done);
            buf[done..done + len].copy_from_slice(&bytes[skip..skip + len]);
            done += len;
        }
        done
    }

    fn write_words(&self, pid: Pid, addr: CoreAddr, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done as u64;
            let aligned = cur & !(WORD as u64 - 1);
            let Ok(word) = sys::ptrace::read(pid, aligned as *mut c_void) else {
                break;
            };
            let mut bytes = (word as u64).to_ne_bytes();
            let skip = (cur - aligned) as usize;
            let len = (WORD - skip).min(data.len() - done);
            bytes[skip..skip + len].copy_from_slice(&data[done..done + len]);
            let word = u64::from_ne_bytes(bytes);
            let written = unsafe {
                sys::ptrace::write(pid, aligned as *mut c_void, word as *mut c_void)
            };
            if written.is_err() {
                break;
            }
            done += len;
        }
        done
    }
}

/// Process leader followed by the other threads of the process.
fn process_threads(pid: Pid) -> Vec<Pid> {
    let sys = System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
    let tasks = sys
        .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
        .and_then(|process| process.tasks());

    let mut threads = vec![pid];
    if let Some(tasks) = tasks {
        threads.extend(
            tasks
                .iter()
                .map(|tid| Pid::from_raw(tid.as_u32() as i32))
                .filter(|tid| *tid != pid),
        );
    }
    threads
}

impl Target for NativeTarget {
    fn shortname(&self) -> &'static str {
        "native"
    }

    fn longname(&self) -> String {
        "Native process".to_string()
    }

    fn stratum(&self) -> Stratum {
        Stratum::Process
    }

    fn close(&mut self) {
        self.forget();
    }

    fn xfer_partial(
        &mut self,
        beneath: Beneath<'_>,
        object: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        let Some(pid) = self.pid else {
            return beneath.xfer_partial(object, offset, req);
        };
        if req.is_empty() {
            return Ok(Transfer::Eof);
        }
        let done = match req {
            TransferRequest::Read(buf) => {
                let remote = RemoteIoVec {
                    base: offset as usize,
                    len: buf.len(),
                };
                let read = uio::process_vm_readv(pid, &mut [IoSliceMut::new(&mut *buf)], &[remote])
                    .unwrap_or(0);
                if read > 0 {
                    read
                } else {
                    self.read_words(pid, offset, buf)
                }
            }
            // text pages are not writable through process_vm_writev
            TransferRequest::Write(data) => self.write_words(pid, offset, data),
        };
        if done == 0 {
            return Ok(Transfer::Io(TransferError::Inaccessible(offset)));
        }
        Ok(Transfer::done(done))
    }

    fn has_all_memory(&self) -> bool {
        self.pid.is_some()
    }

    fn has_memory(&self, beneath: Beneath<'_>) -> bool {
        self.pid.is_some() || beneath.has_memory()
    }

    fn has_execution(&self, _: Beneath<'_>) -> bool {
        self.pid.is_some()
    }

    #[cfg(target_arch = "x86_64")]
    fn fetch_registers(
        &mut self,
        _: Beneath<'_>,
        ptid: Ptid,
        regs: &mut RegisterCache,
    ) -> Result<(), Error> {
        let tid = self.lwp_of(ptid)?;
        let user_regs = sys::ptrace::getregs(tid).map_err(Error::Ptrace)?;
        crate::debugger::register::supply_user_regs(regs, user_regs);
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn store_registers(
        &mut self,
        _: Beneath<'_>,
        ptid: Ptid,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        let tid = self.lwp_of(ptid)?;
        let mut user_regs = sys::ptrace::getregs(tid).map_err(Error::Ptrace)?;
        crate::debugger::register::collect_user_regs(regs, &mut user_regs);
        sys::ptrace::setregs(tid, user_regs).map_err(Error::Ptrace)
    }

    fn resume(&mut self, _: Beneath<'_>, req: ResumeRequest) -> Result<(), Error> {
        if req.direction == ExecDirection::Reverse {
            return Err(Error::Unsupported("reverse execution"));
        }
        let pid = self.pid()?;
        sd_trace!(target: "native", "resume {req:?}");

        let tids: Vec<i32> = self.lwps.keys().copied().collect();
        for tid in tids {
            let unit = self.ptid(Pid::from_raw(tid));
            let is_thread = unit == req.thread || (req.thread.is_process() && tid == pid.as_raw());
            if !unit.matches(req.scope) && !is_thread {
                continue;
            }
            let running = self.lwps.get(&tid).map(|l| l.running).unwrap_or(true);
            // a unit with a queued event stays stopped, the event is reported first
            if running || self.pending.iter().any(|(p, _)| *p == unit) {
                continue;
            }
            let signal = if is_thread { req.signal } else { None };
            let lwp = Pid::from_raw(tid);
            if is_thread && req.step {
                sys::ptrace::step(lwp, signal).map_err(Error::Ptrace)?;
                if let Some(l) = self.lwps.get_mut(&tid) {
                    l.running = true;
                    l.stopped_by_breakpoint = false;
                }
            } else {
                self.cont(lwp, signal)?;
            }
        }
        self.process_running = req.scope.is_process() || req.scope.is_any();
        Ok(())
    }

    fn wait(
        &mut self,
        _: Beneath<'_>,
        ptid: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        self.pid()?;
        loop {
            if let Some(pos) = self.pending.iter().position(|(p, _)| p.matches(ptid)) {
                let event = self.pending.remove(pos);
                self.stop_all()?;
                return Ok(event);
            }
            if let Some(event) = self.poll()? {
                if !matches!(
                    event.1,
                    WaitStatus::Exited(_) | WaitStatus::Signalled(_) | WaitStatus::ThreadExited
                ) {
                    self.stop_all()?;
                }
                return Ok(Some(event));
            }
            if opts.nohang {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn stop(&mut self, _: Beneath<'_>, ptid: Ptid) -> Result<(), Error> {
        let pid = self.pid()?;
        for (tid, lwp) in self.lwps.iter_mut() {
            let unit = Ptid::new(pid.as_raw(), *tid as i64, 0);
            if !lwp.running || !unit.matches(ptid) || lwp.interrupt_requested {
                continue;
            }
            sys::ptrace::interrupt(Pid::from_raw(*tid)).map_err(Error::Ptrace)?;
            lwp.interrupt_requested = true;
        }
        Ok(())
    }

    fn create_inferior(
        &mut self,
        _: Beneath<'_>,
        program: &Path,
        args: &[String],
    ) -> Result<Ptid, Error> {
        if self.pid.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                Ok(())
            });
        }

        match unsafe { fork() }.map_err(|e| Error::Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Error::Waitpid)?;
                sys::ptrace::seize(pid, trace_options()).map_err(Error::Ptrace)?;
                sys::ptrace::cont(pid, None).map_err(Error::Ptrace)?;

                // run until the new program image is loaded
                loop {
                    match waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Error::Waitpid)? {
                        PidStatus::PtraceEvent(_, _, code)
                            if code == Event::PTRACE_EVENT_EXEC as i32 =>
                        {
                            break
                        }
                        PidStatus::Exited(_, code) => {
                            return Err(Error::InvalidArgument(format!(
                                "cannot run {}: exited with code {code}",
                                program.display()
                            )))
                        }
                        PidStatus::Signaled(_, signal, _) => {
                            return Err(Error::InvalidArgument(format!(
                                "cannot run {}: killed by {signal}",
                                program.display()
                            )))
                        }
                        _ => sys::ptrace::cont(pid, None).map_err(Error::Ptrace)?,
                    }
                }

                self.pid = Some(pid);
                self.lwps.insert(pid.as_raw(), Lwp::default());
                sd_debug!(target: "native", "process {pid} created for {}", program.display());
                Ok(Ptid::new(pid.as_raw(), pid.as_raw() as i64, 0))
            }
            ForkResult::Child => {
                let _ = sys::signal::raise(SIGSTOP);
                let err = cmd.exec();
                eprintln!("run {} fail with: {err}", program.display());
                std::process::exit(127);
            }
        }
    }

    fn attach(&mut self, _: Beneath<'_>, pid: i32) -> Result<Ptid, Error> {
        if self.pid.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let pid = Pid::from_raw(pid);
        self.pid = Some(pid);

        // threads may be created while attaching, so at least two rounds
        let mut rounds = 0;
        loop {
            let new: Vec<Pid> = process_threads(pid)
                .into_iter()
                .filter(|tid| !self.lwps.contains_key(&tid.as_raw()))
                .collect();
            if new.is_empty() && rounds >= 2 {
                break;
            }
            rounds += 1;

            for tid in &new {
                if let Err(e) = sys::ptrace::seize(*tid, trace_options()) {
                    if *tid == pid {
                        self.forget();
                        return Err(Error::Ptrace(e));
                    }
                    // thread is already gone
                    continue;
                }
                self.lwps.insert(
                    tid.as_raw(),
                    Lwp {
                        running: true,
                        ..Lwp::default()
                    },
                );
            }
            self.stop_all()?;
        }
        sd_debug!(target: "native", "attached to {pid}, {} threads", self.lwps.len());
        Ok(Ptid::new(pid.as_raw(), pid.as_raw() as i64, 0))
    }

    fn detach(&mut self, _: Beneath<'_>, pid: i32) -> Result<(), Error> {
        if self.pid != Some(Pid::from_raw(pid)) {
            return Err(Error::NoProcess);
        }
        self.stop_all()?;
        for (tid, _) in std::mem::take(&mut self.lwps) {
            let tid = Pid::from_raw(tid);
            // pending signals are delivered on detach
            let signal = self.pending.iter().find_map(|(p, status)| match status {
                WaitStatus::Stopped(sig) if p.lwp == tid.as_raw() as i64 && *sig != SIGTRAP => {
                    Some(*sig)
                }
                _ => None,
            });
            weak_error!(sys::ptrace::detach(tid, signal), "detach thread:");
        }
        self.forget();
        Ok(())
    }

    fn kill(&mut self, _: Beneath<'_>, pid: i32) -> Result<(), Error> {
        let Some(own_pid) = self.pid.filter(|p| p.as_raw() == pid) else {
            return Err(Error::NoProcess);
        };
        sys::signal::kill(own_pid, SIGKILL).map_err(|e| Error::Syscall("kill", e))?;
        let tids: Vec<i32> = self.lwps.keys().copied().collect();
        for tid in tids {
            loop {
                match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL)) {
                    Ok(PidStatus::Exited(..)) | Ok(PidStatus::Signaled(..)) | Err(_) => break,
                    Ok(_) => {
                        let _ = sys::ptrace::cont(Pid::from_raw(tid), None);
                    }
                }
            }
        }
        sd_debug!(target: "native", "process {pid} killed");
        self.forget();
        Ok(())
    }

    fn mourn_inferior(&mut self, _: Beneath<'_>, pid: i32) {
        if self.pid == Some(Pid::from_raw(pid)) {
            self.forget();
        }
    }

    fn thread_alive(&self, _: Beneath<'_>, ptid: Ptid) -> bool {
        self.lwp_of(ptid).is_ok()
    }

    fn update_thread_list(&mut self, _: Beneath<'_>, list: &mut Vec<Ptid>) -> Result<(), Error> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        list.extend(
            self.lwps
                .keys()
                .map(|tid| Ptid::new(pid.as_raw(), *tid as i64, 0)),
        );
        Ok(())
    }

    fn pid_to_str(&self, _: Beneath<'_>, ptid: Ptid) -> String {
        if ptid.lwp == 0 {
            format!("process {}", ptid.pid)
        } else {
            format!("Thread {}.{}", ptid.pid, ptid.lwp)
        }
    }

    fn stopped_by_sw_breakpoint(&self, _: Beneath<'_>, ptid: Ptid) -> bool {
        self.lwp_of(ptid)
            .ok()
            .and_then(|tid| self.lwps.get(&tid.as_raw()))
            .map(|lwp| lwp.stopped_by_breakpoint)
            .unwrap_or(false)
    }
}
