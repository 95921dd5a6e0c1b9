pub mod arch;
pub mod bookmark;
pub mod breakpoint;
pub mod error;
pub mod event;
pub mod fsm;
pub mod infrun;
pub mod memory;
pub mod ptid;
pub mod register;
pub mod signals;
pub mod symbols;
pub mod target;
pub mod thread;
pub mod vunit;

pub use error::Error;
pub use infrun::{StopEvent, StopOutcome, StopReason};

use crate::config::DebuggerConfig;
use crate::debugger::arch::{Arch, FrameId, FrameInfo, FrameKind, ReturnValue, Unwinder, UnwindContext};
use crate::debugger::bookmark::{Bookmark, BookmarkLedger};
use crate::debugger::breakpoint::{Breakpoint, BreakpointTable};
use crate::debugger::event::{AsyncSignalHandler, DispatchContext, EventLoop, SignalToken};
use crate::debugger::fsm::{FinishFsm, Prepared, StepFsm, ThreadFsm, UntilBreakFsm, UntilNextFsm};
use crate::debugger::memory::{MemAccess, MemRegion, MemoryPipeline, MemoryView};
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::signals::{SignalPolicy, SignalTable};
use crate::debugger::symbols::{FunctionBounds, LineResolver, Linespec, NoSymbols};
use crate::debugger::target::exec::ExecTarget;
use crate::debugger::target::record::RecordTarget;
use crate::debugger::target::{ExecDirection, LayerInfo, Stratum, TargetObject, TargetRef, TargetStack};
use crate::debugger::thread::{ThreadInfo, ThreadList, ThreadState};
use crate::debugger::vunit::{RuntimeLayout, TaskRegisterAccess, TaskTarget};
use crate::{sd_debug, sd_info, weak_error};
use nix::sys::signal::Signal;
use signal_hook::SigId;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Address in the debuggee address space.
pub type CoreAddr = u64;

/// Front end notifications.
pub trait EventHook {
    /// Execution command completed, or an interrupt or a signal stopped the program.
    fn on_stop(&self, outcome: &StopOutcome) -> anyhow::Result<()>;

    fn on_signal(&self, _ptid: Ptid, _signal: Signal) {}

    fn on_exit(&self, _pid: i32, _code: i32) {}

    fn on_new_thread(&self, _ptid: Ptid) {}
}

/// Hooks that ignore everything.
#[derive(Default)]
pub struct NopHook;

impl EventHook for NopHook {
    fn on_stop(&self, _: &StopOutcome) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory of the process stratum layer used by `run` and `attach`.
pub type RunTargetFactory = Box<dyn Fn() -> Result<TargetRef, Error>>;

/// A program being debugged: its own stack of layers, memory pipeline and units.
pub struct Inferior {
    num: u32,
    stack: TargetStack,
    memory: MemoryPipeline,
    threads: ThreadList,
    pid: Option<i32>,
    /// The process was attached to (and must be detached instead of killed).
    attached: bool,
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl Inferior {
    fn new(num: u32, config: &DebuggerConfig) -> Self {
        Self {
            num,
            stack: TargetStack::new(),
            memory: MemoryPipeline::new(config),
            threads: ThreadList::default(),
            pid: None,
            attached: false,
            program: None,
            args: vec![],
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    pub fn stack(&self) -> &TargetStack {
        &self.stack
    }

    pub fn memory(&self) -> &MemoryPipeline {
        &self.memory
    }

    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }
}

/// Row of `info threads`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub num: u32,
    pub ptid: Ptid,
    pub target_id: String,
    pub state: ThreadState,
    pub pc: Option<CoreAddr>,
    pub selected: bool,
}

pub struct DebuggerBuilder {
    config: DebuggerConfig,
    arch: Rc<dyn Arch>,
    symbols: Rc<dyn LineResolver>,
    unwinder: Box<dyn Unwinder>,
    hooks: Vec<Box<dyn EventHook>>,
    run_target: RunTargetFactory,
    max_frames: usize,
}

#[cfg(target_os = "linux")]
fn native_run_target() -> Result<TargetRef, Error> {
    Ok(TargetRef::new(target::native::NativeTarget::new()))
}

#[cfg(not(target_os = "linux"))]
fn native_run_target() -> Result<TargetRef, Error> {
    Err(Error::Unsupported("native debugging on this platform"))
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            config: DebuggerConfig::default(),
            arch: Rc::new(arch::X86_64),
            symbols: Rc::new(NoSymbols),
            unwinder: Box::new(arch::FramePointerUnwinder::x86_64()),
            hooks: vec![],
            run_target: Box::new(native_run_target),
            max_frames: 256,
        }
    }

    pub fn with_config(self, config: DebuggerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_arch(self, arch: impl Arch + 'static) -> Self {
        Self {
            arch: Rc::new(arch),
            ..self
        }
    }

    pub fn with_symbols(self, symbols: impl LineResolver + 'static) -> Self {
        Self {
            symbols: Rc::new(symbols),
            ..self
        }
    }

    pub fn with_unwinder(self, unwinder: impl Unwinder + 'static) -> Self {
        Self {
            unwinder: Box::new(unwinder),
            ..self
        }
    }

    /// Add a front end. The first one becomes the primary front end.
    pub fn with_hooks(mut self, hooks: impl EventHook + 'static) -> Self {
        self.hooks.push(Box::new(hooks));
        self
    }

    pub fn with_run_target(
        self,
        factory: impl Fn() -> Result<TargetRef, Error> + 'static,
    ) -> Self {
        Self {
            run_target: Box::new(factory),
            ..self
        }
    }

    pub fn with_max_frames(self, max_frames: usize) -> Self {
        Self { max_frames, ..self }
    }

    pub fn build(mut self) -> Result<Debugger, Error> {
        if self.hooks.is_empty() {
            self.hooks.push(Box::new(NopHook));
        }
        let event_loop = EventLoop::new()?;
        let interrupt = event_loop
            .create_async_signal_handler("interrupt", |dbg: &mut Debugger| dbg.handle_interrupt());
        let child = event_loop.create_async_signal_handler("sigchld", |_: &mut Debugger| {});

        Ok(Debugger {
            inferiors: vec![Inferior::new(1, &self.config)],
            current_inferior: 0,
            next_inferior_num: 2,
            next_thread_num: 1,
            selected_thread: None,
            config: self.config,
            arch: self.arch,
            symbols: self.symbols,
            unwinder: self.unwinder,
            hooks: self.hooks,
            primary_ui: 0,
            current_ui: 0,
            breakpoints: BreakpointTable::new(),
            bookmarks: BookmarkLedger::new(),
            signals: SignalTable::default(),
            direction: ExecDirection::Forward,
            event_loop,
            interrupt,
            child,
            sig_ids: vec![],
            run_target: self.run_target,
            max_frames: self.max_frames,
        })
    }
}

/// Main structure of the execution control core.
pub struct Debugger {
    config: DebuggerConfig,
    arch: Rc<dyn Arch>,
    symbols: Rc<dyn LineResolver>,
    unwinder: Box<dyn Unwinder>,
    /// Front ends, all of them are notified about stops.
    hooks: Vec<Box<dyn EventHook>>,
    primary_ui: usize,
    current_ui: usize,
    inferiors: Vec<Inferior>,
    current_inferior: usize,
    next_inferior_num: u32,
    next_thread_num: u32,
    selected_thread: Option<Ptid>,
    breakpoints: BreakpointTable,
    bookmarks: BookmarkLedger,
    signals: SignalTable,
    direction: ExecDirection,
    event_loop: EventLoop<Debugger>,
    interrupt: AsyncSignalHandler,
    child: AsyncSignalHandler,
    sig_ids: Vec<SigId>,
    run_target: RunTargetFactory,
    max_frames: usize,
}

impl DispatchContext for Debugger {
    fn switch_to_primary(&mut self) {
        self.current_ui = self.primary_ui;
    }
}

impl Debugger {
    // --------------------------------- helpers ---------------------------------------------------

    fn current(&self) -> &Inferior {
        &self.inferiors[self.current_inferior]
    }

    fn current_mut(&mut self) -> &mut Inferior {
        &mut self.inferiors[self.current_inferior]
    }

    fn current_pid(&self) -> Result<i32, Error> {
        self.current().pid.ok_or(Error::NoProcess)
    }

    /// Index of the inferior that runs the process.
    fn inferior_index(&self, pid: i32) -> Result<usize, Error> {
        self.inferiors
            .iter()
            .position(|inf| inf.pid == Some(pid))
            .ok_or(Error::NoProcess)
    }

    fn threads_mut(&mut self, pid: i32) -> Option<&mut ThreadList> {
        self.inferiors
            .iter_mut()
            .find(|inf| inf.pid == Some(pid))
            .map(|inf| &mut inf.threads)
    }

    fn thread(&self, ptid: Ptid) -> Option<&ThreadInfo> {
        self.inferiors
            .iter()
            .find(|inf| inf.pid == Some(ptid.pid))
            .and_then(|inf| inf.threads.get(ptid))
    }

    fn thread_mut(&mut self, ptid: Ptid) -> Result<&mut ThreadInfo, Error> {
        self.threads_mut(ptid.pid)
            .and_then(|threads| threads.get_mut(ptid))
            .ok_or(Error::ThreadNotFound(ptid))
    }

    /// Unit commands apply to: the selected one or the first unit of the current process.
    fn current_thread(&self) -> Result<Ptid, Error> {
        let inf = self.current();
        if inf.pid.is_none() {
            return Err(Error::NoProcess);
        }
        if let Some(selected) = self.selected_thread.filter(|t| inf.threads.contains(*t)) {
            return Ok(selected);
        }
        inf.threads.first().ok_or(Error::NoThreadSelected)
    }

    /// Drop cached memory and registers of the process.
    fn invalidate_state(&mut self, pid: i32) {
        if let Ok(idx) = self.inferior_index(pid) {
            let inf = &mut self.inferiors[idx];
            inf.memory.invalidate_cache();
            inf.threads.invalidate_registers();
        }
    }

    fn add_thread(&mut self, ptid: Ptid) {
        let num = self.next_thread_num;
        let Some(threads) = self.threads_mut(ptid.pid) else {
            return;
        };
        if threads.add(ptid, num) {
            self.next_thread_num += 1;
            sd_debug!(target: "debugger", "new unit {ptid}");
            for hook in &self.hooks {
                hook.on_new_thread(ptid);
            }
        }
    }

    /// Synchronize known units with the units the stack reports.
    fn update_thread_list(&mut self, pid: i32) -> Result<(), Error> {
        let idx = self.inferior_index(pid)?;
        let mut live = vec![];
        self.inferiors[idx].stack.top().update_thread_list(&mut live)?;
        live.retain(|p| p.pid == pid && !p.is_process());

        let gone: Vec<Ptid> = self.inferiors[idx]
            .threads
            .ptids()
            .into_iter()
            .filter(|p| !live.contains(p))
            .collect();
        for ptid in gone {
            self.thread_gone(ptid);
        }
        for ptid in live {
            self.add_thread(ptid);
        }
        Ok(())
    }

    pub(crate) fn thread_registers(&mut self, ptid: Ptid) -> Result<RegisterCache, Error> {
        let idx = self.inferior_index(ptid.pid)?;
        let inf = &mut self.inferiors[idx];
        if let Some(regs) = inf.threads.get(ptid).and_then(|t| t.regcache.clone()) {
            return Ok(regs);
        }
        let mut regs = RegisterCache::new();
        inf.stack.top().fetch_registers(ptid, &mut regs)?;
        if let Some(info) = inf.threads.get_mut(ptid) {
            info.regcache = Some(regs.clone());
        }
        Ok(regs)
    }

    fn store_register(&mut self, ptid: Ptid, name: &str, bytes: &[u8]) -> Result<(), Error> {
        let mut regs = self.thread_registers(ptid)?;
        if !regs.contains(name) {
            return Err(Error::RegisterNameNotFound(name.to_string()));
        }
        regs.supply(name, bytes);
        let idx = self.inferior_index(ptid.pid)?;
        let inf = &mut self.inferiors[idx];
        inf.stack.top().store_registers(ptid, &regs)?;
        if let Some(info) = inf.threads.get_mut(ptid) {
            info.regcache = Some(regs);
        }
        Ok(())
    }

    pub(crate) fn thread_pc(&mut self, ptid: Ptid) -> Result<CoreAddr, Error> {
        let pc_name = self.arch.pc_register();
        self.thread_registers(ptid)?
            .get_u64(pc_name)
            .ok_or_else(|| Error::RegisterUnavailable(pc_name.to_string()))
    }

    fn write_pc(&mut self, ptid: Ptid, pc: CoreAddr) -> Result<(), Error> {
        let pc_name = self.arch.pc_register();
        let size = self
            .thread_registers(ptid)?
            .get(pc_name)
            .map(|raw| raw.len())
            .unwrap_or(8)
            .min(8);
        self.store_register(ptid, pc_name, &pc.to_le_bytes()[..size])
    }

    /// Frames as the unwinder sees them, without inlined calls.
    pub(crate) fn physical_frames(&mut self, ptid: Ptid) -> Result<Vec<FrameInfo>, Error> {
        let regs = self.thread_registers(ptid)?;
        let idx = self.inferior_index(ptid.pid)?;
        let inf = &mut self.inferiors[idx];
        let mut mem = MemoryView {
            pipeline: &mut inf.memory,
            stack: &inf.stack,
            object: TargetObject::StackMemory,
        };
        self.unwinder.unwind(UnwindContext {
            regs: &regs,
            mem: &mut mem,
            symbols: &*self.symbols,
            arch: &*self.arch,
            max_frames: self.max_frames,
        })
    }

    /// Frames as the user sees them: a virtual frame for an inlined call is placed above the
    /// physical innermost frame, unless the unit is at the first instruction of a skipped call.
    pub(crate) fn frames(&mut self, ptid: Ptid) -> Result<Vec<FrameInfo>, Error> {
        let mut frames = self.physical_frames(ptid)?;
        let Some(innermost) = frames.first().cloned() else {
            return Ok(frames);
        };
        let Some(block) = self.symbols.inline_block_at(innermost.pc) else {
            return Ok(frames);
        };
        let skipped = self
            .thread(ptid)
            .and_then(|t| t.inline_skipped.as_ref())
            .map(|b| b.low == block.low && b.high == block.high)
            .unwrap_or(false);
        if skipped {
            return Ok(frames);
        }

        frames.insert(
            0,
            FrameInfo {
                level: 0,
                pc: innermost.pc,
                id: FrameId {
                    stack: innermost.id.stack,
                    code: block.low,
                },
                kind: FrameKind::Inline,
                writable: innermost.writable,
                function: Some(FunctionBounds {
                    name: block.name,
                    low: block.low,
                    high: block.high,
                }),
            },
        );
        for (level, frame) in frames.iter_mut().enumerate() {
            frame.level = level;
        }
        Ok(frames)
    }

    /// Drop stepping state of a unit, including its step-resume breakpoint.
    pub(crate) fn clear_step_state(&mut self, ptid: Ptid) {
        let Ok(info) = self.thread_mut(ptid) else {
            return;
        };
        let step_resume = info.control.step_resume_bp.take();
        info.control = Default::default();
        if let Some(bp) = step_resume {
            self.breakpoints.discard(bp);
        }
    }

    /// Value returned by `function`, read right after it returned.
    pub(crate) fn function_return_value(
        &mut self,
        ptid: Ptid,
        function: &FunctionBounds,
    ) -> Result<Option<ReturnValue>, Error> {
        let Some(ty) = self.symbols.return_type(function) else {
            return Ok(None);
        };
        let regs = self.thread_registers(ptid)?;
        Ok(self
            .arch
            .return_value(&regs, &ty)?
            .map(|bytes| ReturnValue { ty, bytes }))
    }

    fn resolve_location(&self, location: &str) -> Result<CoreAddr, Error> {
        let spec: Linespec = location.parse()?;
        self.symbols
            .resolve(&spec)
            .ok_or_else(|| Error::SymbolNotFound(location.to_string()))
    }

    fn ensure_stopped(&self, ptid: Ptid) -> Result<(), Error> {
        match self.thread(ptid).map(|t| t.state) {
            Some(ThreadState::Stopped) => Ok(()),
            Some(_) => Err(Error::AlreadyRunning),
            None => Err(Error::ThreadNotFound(ptid)),
        }
    }

    /// Install the machine of a command and run the program until the command completes.
    fn run_fsm(&mut self, thread: Ptid, fsm: ThreadFsm) -> Result<StopOutcome, Error> {
        self.thread_mut(thread)?.fsm = Some(fsm);
        self.proceed(thread)
    }

    /// Interrupt handler body: stop the running unit, or the whole process if more units run.
    fn handle_interrupt(&mut self) {
        let Some(pid) = self.current().pid else {
            return;
        };
        weak_error!(self.request_stop(pid), "interrupt:");
    }

    fn request_stop(&mut self, pid: i32) -> Result<(), Error> {
        let idx = self.inferior_index(pid)?;
        let inf = &mut self.inferiors[idx];
        let running: Vec<Ptid> = inf
            .threads
            .iter()
            .filter(|t| t.state == ThreadState::Running)
            .map(|t| t.ptid)
            .collect();
        let scope = match running.as_slice() {
            [] => {
                sd_debug!(target: "debugger", "interrupt: nothing runs");
                return Ok(());
            }
            [single] => *single,
            _ => Ptid::from_pid(pid),
        };
        for ptid in running {
            if let Some(info) = inf.threads.get_mut(ptid) {
                info.stop_requested = true;
            }
        }
        sd_debug!(target: "debugger", "interrupt {scope}");
        inf.stack.top().stop(scope)
    }

    // --------------------------------- setup -----------------------------------------------------

    /// Register process signal handlers: SIGINT interrupts the program, SIGCHLD wakes the wait.
    pub fn install_signal_handlers(&mut self) -> Result<(), Error> {
        self.sig_ids.push(event::install_handler(
            signal_hook::consts::SIGINT,
            self.interrupt.token.clone(),
        )?);
        self.sig_ids.push(event::install_handler(
            signal_hook::consts::SIGCHLD,
            self.child.token.clone(),
        )?);
        Ok(())
    }

    /// Token that requests an interrupt of the running program.
    pub fn interrupt_token(&self) -> SignalToken {
        self.interrupt.token.clone()
    }

    pub fn event_loop(&self) -> EventLoop<Debugger> {
        self.event_loop.clone()
    }

    /// Run one pass of the event loop outside of execution commands.
    pub fn process_events(&mut self, block: bool) -> Result<bool, Error> {
        let event_loop = self.event_loop.clone();
        event_loop.do_one_event(self, block)
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: DebuggerConfig) {
        for inf in &mut self.inferiors {
            inf.memory.apply_config(&config);
        }
        self.config = config;
    }

    /// Add a front end, return its index.
    pub fn add_ui(&mut self, hooks: impl EventHook + 'static) -> usize {
        self.hooks.push(Box::new(hooks));
        self.hooks.len() - 1
    }

    pub fn set_primary_ui(&mut self, idx: usize) -> Result<(), Error> {
        if idx >= self.hooks.len() {
            return Err(Error::InvalidArgument(format!("no ui number {idx}")));
        }
        self.primary_ui = idx;
        Ok(())
    }

    pub fn switch_ui(&mut self, idx: usize) -> Result<(), Error> {
        if idx >= self.hooks.len() {
            return Err(Error::InvalidArgument(format!("no ui number {idx}")));
        }
        self.current_ui = idx;
        Ok(())
    }

    pub fn current_ui(&self) -> usize {
        self.current_ui
    }

    pub fn primary_ui(&self) -> usize {
        self.primary_ui
    }

    // --------------------------------- inferiors -------------------------------------------------

    /// Set program and arguments used by the next `run` of the current inferior.
    pub fn set_program(&mut self, program: impl Into<PathBuf>, args: Vec<String>) {
        let inf = self.current_mut();
        inf.program = Some(program.into());
        inf.args = args;
    }

    /// Open an executable file and push it at the file stratum of the current inferior.
    pub fn exec_file(&mut self, path: &Path) -> Result<(), Error> {
        let layer = TargetRef::new(ExecTarget::open(path)?);
        self.push_target(layer)?;
        if self.current().program.is_none() {
            self.current_mut().program = Some(path.to_path_buf());
        }
        Ok(())
    }

    /// Push a layer on the stack of the current inferior.
    pub fn push_target(&mut self, layer: TargetRef) -> Result<(), Error> {
        let inf = self.current_mut();
        inf.stack.push(layer)?;
        inf.memory.invalidate_cache();
        Ok(())
    }

    /// Unpush whatever occupies the stratum of the current inferior stack.
    pub fn unpush_target(&mut self, stratum: Stratum) -> Result<bool, Error> {
        let inf = self.current_mut();
        inf.memory.invalidate_cache();
        inf.stack.unpush_stratum(stratum)
    }

    /// Add an inferior, return its number. With `copy_exec` the new inferior shares the file
    /// layer of the current one.
    pub fn add_inferior(&mut self, copy_exec: bool) -> Result<u32, Error> {
        let num = self.next_inferior_num;
        let mut inf = Inferior::new(num, &self.config);
        if copy_exec {
            let current = self.current();
            if let Some(exec) = current.stack.find(Stratum::File).cloned() {
                inf.stack.push(exec)?;
            }
            inf.program = current.program.clone();
            inf.args = current.args.clone();
        }
        self.next_inferior_num += 1;
        self.inferiors.push(inf);
        Ok(num)
    }

    pub fn switch_inferior(&mut self, num: u32) -> Result<(), Error> {
        let idx = self
            .inferiors
            .iter()
            .position(|inf| inf.num == num)
            .ok_or(Error::InferiorNotFound(num))?;
        self.current_inferior = idx;
        self.selected_thread = self.inferiors[idx].threads.first();
        Ok(())
    }

    /// Remove an inferior that has no process and is not current.
    pub fn remove_inferior(&mut self, num: u32) -> Result<(), Error> {
        let idx = self
            .inferiors
            .iter()
            .position(|inf| inf.num == num)
            .ok_or(Error::InferiorNotFound(num))?;
        if idx == self.current_inferior {
            return Err(Error::InvalidArgument(
                "can not remove the current inferior".to_string(),
            ));
        }
        if self.inferiors[idx].pid.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.inferiors.remove(idx);
        if self.current_inferior > idx {
            self.current_inferior -= 1;
        }
        Ok(())
    }

    pub fn inferiors(&self) -> impl Iterator<Item = &Inferior> {
        self.inferiors.iter()
    }

    pub fn current_inferior(&self) -> &Inferior {
        self.current()
    }

    // --------------------------------- process lifecycle -----------------------------------------

    /// Create the process of the current inferior, stopped at its first instruction.
    pub fn start(&mut self) -> Result<Ptid, Error> {
        if self.current().pid.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let program = self
            .current()
            .program
            .clone()
            .ok_or_else(|| Error::InvalidArgument("no executable file specified".to_string()))?;
        let args = self.current().args.clone();

        let layer = (self.run_target)()?;
        self.push_target(layer.clone())?;
        let created = self.current().stack.top().create_inferior(&program, &args);
        let ptid = match created {
            Ok(ptid) => ptid,
            Err(e) => {
                weak_error!(self.current_mut().stack.unpush(&layer), "unpush run target:");
                return Err(e);
            }
        };
        sd_info!(target: "debugger", "{} started as {}", program.display(), ptid.process());
        self.install_process(ptid, false)
    }

    /// Create the process and run it until something stops it.
    pub fn run(&mut self) -> Result<StopOutcome, Error> {
        let ptid = self.start()?;
        self.proceed(ptid)
    }

    pub fn attach(&mut self, pid: i32) -> Result<Ptid, Error> {
        if self.current().pid.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let mut pushed = None;
        if !self.current().stack.top().has_execution() {
            let layer = (self.run_target)()?;
            self.push_target(layer.clone())?;
            pushed = Some(layer);
        }
        let ptid = match self.current().stack.top().attach(pid) {
            Ok(ptid) => ptid,
            Err(e) => {
                if let Some(layer) = pushed {
                    weak_error!(self.current_mut().stack.unpush(&layer), "unpush run target:");
                }
                return Err(e);
            }
        };
        sd_info!(target: "debugger", "attached to {}", ptid.process());
        self.install_process(ptid, true)
    }

    fn install_process(&mut self, ptid: Ptid, attached: bool) -> Result<Ptid, Error> {
        let inf = self.current_mut();
        inf.pid = Some(ptid.pid);
        inf.attached = attached;
        inf.memory.invalidate_cache();
        weak_error!(self.update_thread_list(ptid.pid), "update thread list:");
        let thread = if ptid.is_process() {
            self.current().threads.first().unwrap_or(ptid)
        } else {
            self.add_thread(ptid);
            ptid
        };
        self.selected_thread = Some(thread);
        Ok(thread)
    }

    pub fn detach(&mut self) -> Result<(), Error> {
        let pid = self.current_pid()?;
        self.remove_breakpoints(pid);
        self.current().stack.top().detach(pid)?;
        self.process_gone(pid);
        Ok(())
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        let pid = self.current_pid()?;
        self.remove_breakpoints(pid);
        self.current().stack.top().kill(pid)?;
        self.process_gone(pid);
        Ok(())
    }

    // --------------------------------- execution commands ----------------------------------------

    /// Resume the program in the current direction.
    pub fn continue_execution(&mut self) -> Result<StopOutcome, Error> {
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        self.clear_step_state(thread);
        self.proceed(thread)
    }

    fn step_command(
        &mut self,
        count: u32,
        single_inst: bool,
        skip_subroutines: bool,
    ) -> Result<StopOutcome, Error> {
        if count == 0 {
            return Err(Error::InvalidArgument("count must be positive".to_string()));
        }
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        let (fsm, prepared) = StepFsm::prepare(self, thread, count, single_inst, skip_subroutines)?;
        let mut fsm = ThreadFsm::Step(fsm);
        if prepared == Prepared::Done {
            let reason = fsm.classify().unwrap_or(StopReason::EndSteppingRange);
            fsm.clean_up(self);
            let pc = self.thread_pc(thread)?;
            return self.normal_stop(StopOutcome {
                ptid: thread,
                pc: Some(pc),
                location: None,
                reason,
            });
        }
        self.run_fsm(thread, fsm)
    }

    pub fn step(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.step_command(count, false, false)
    }

    pub fn next(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.step_command(count, false, true)
    }

    pub fn stepi(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.step_command(count, true, false)
    }

    pub fn nexti(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.step_command(count, true, true)
    }

    /// `until` without argument.
    pub fn until_next(&mut self) -> Result<StopOutcome, Error> {
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        let fsm = UntilNextFsm::prepare(self, thread)?;
        self.run_fsm(thread, ThreadFsm::UntilNext(fsm))
    }

    fn until_break(&mut self, location: &str, anywhere: bool) -> Result<StopOutcome, Error> {
        let addr = self.resolve_location(location)?;
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        let fsm = UntilBreakFsm::prepare(self, thread, addr, anywhere)?;
        self.run_fsm(thread, ThreadFsm::UntilBreak(fsm))
    }

    /// Run until the location in the current frame is reached or the frame returns.
    pub fn until(&mut self, location: &str) -> Result<StopOutcome, Error> {
        self.until_break(location, false)
    }

    /// Run until the location is reached in any frame or the current frame returns.
    pub fn advance(&mut self, location: &str) -> Result<StopOutcome, Error> {
        self.until_break(location, true)
    }

    pub fn finish(&mut self) -> Result<StopOutcome, Error> {
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        let fsm = FinishFsm::prepare(self, thread)?;
        self.run_fsm(thread, ThreadFsm::Finish(fsm))
    }

    /// Resume at another address.
    pub fn jump(&mut self, location: &str) -> Result<StopOutcome, Error> {
        let addr = self.resolve_location(location)?;
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        self.clear_step_state(thread);
        self.write_pc(thread, addr)?;
        self.thread_mut(thread)?.inline_skipped = None;
        self.proceed(thread)
    }

    /// Resume delivering `signal` to the current unit. `None` (`signal 0`) resumes without a
    /// signal, cancelling the signal the unit stopped with.
    pub fn signal(&mut self, signal: Option<Signal>) -> Result<StopOutcome, Error> {
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        self.clear_step_state(thread);
        self.thread_mut(thread)?.stop_signal = signal;
        self.proceed(thread)
    }

    /// Queue a signal for delivery at the next resume of the current unit.
    pub fn queue_signal(&mut self, signal: Signal) -> Result<(), Error> {
        let thread = self.current_thread()?;
        if !self.signals.policy(signal).pass {
            return Err(Error::InvalidArgument(format!(
                "signal {signal} is not passed to the program"
            )));
        }
        self.thread_mut(thread)?.stop_signal = Some(signal);
        Ok(())
    }

    /// Units other than the current one holding a signal that will be delivered when they
    /// resume. `signal 0` does not cancel those.
    pub fn pending_signals_elsewhere(&self) -> Result<Vec<(Ptid, Signal)>, Error> {
        let thread = self.current_thread()?;
        Ok(self
            .current()
            .threads
            .iter()
            .filter(|t| t.ptid != thread)
            .filter_map(|t| t.stop_signal.map(|s| (t.ptid, s)))
            .filter(|(_, s)| self.signals.policy(*s).pass)
            .collect())
    }

    /// Ask the running program to stop. The stop is reported by the running command.
    pub fn interrupt(&mut self) -> Result<(), Error> {
        let pid = self.current_pid()?;
        self.request_stop(pid)
    }

    pub fn handle_signal(&mut self, signal: Signal, policy: SignalPolicy) {
        self.signals.set(signal, policy);
    }

    pub fn signal_policy(&self, signal: Signal) -> SignalPolicy {
        self.signals.policy(signal)
    }

    // --------------------------------- reverse execution -----------------------------------------

    pub fn exec_direction(&self) -> ExecDirection {
        self.direction
    }

    pub fn set_exec_direction(&mut self, direction: ExecDirection) -> Result<(), Error> {
        if direction == ExecDirection::Reverse && !self.current().stack.top().can_execute_reverse()
        {
            return Err(Error::Unsupported("reverse execution"));
        }
        self.direction = direction;
        Ok(())
    }

    /// Run a command backward, the direction is restored even if the command fails.
    fn reversed<T>(
        &mut self,
        command: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.direction == ExecDirection::Reverse {
            return Err(Error::AlreadyReverse);
        }
        self.set_exec_direction(ExecDirection::Reverse)?;
        let res = command(self);
        self.direction = ExecDirection::Forward;
        res
    }

    pub fn reverse_step(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.step(count))
    }

    pub fn reverse_next(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.next(count))
    }

    pub fn reverse_stepi(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.stepi(count))
    }

    pub fn reverse_nexti(&mut self, count: u32) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.nexti(count))
    }

    pub fn reverse_continue(&mut self) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.continue_execution())
    }

    pub fn reverse_finish(&mut self) -> Result<StopOutcome, Error> {
        self.reversed(|dbg| dbg.finish())
    }

    /// Start recording the execution of the current process.
    pub fn record_start(&mut self) -> Result<(), Error> {
        self.current_pid()?;
        if self.current().stack.has_stratum(Stratum::Record) {
            return Err(Error::InvalidArgument(
                "the process is already being recorded".to_string(),
            ));
        }
        let layer = RecordTarget::new(self.arch.clone(), self.config.record_insn_limit);
        self.push_target(TargetRef::new(layer))
    }

    /// Stop recording, the recorded history is discarded.
    pub fn record_stop(&mut self) -> Result<(), Error> {
        if !self.unpush_target(Stratum::Record)? {
            return Err(Error::InvalidArgument(
                "the process is not being recorded".to_string(),
            ));
        }
        if let Some(pid) = self.current().pid {
            self.invalidate_state(pid);
        }
        self.direction = ExecDirection::Forward;
        Ok(())
    }

    // --------------------------------- bookmarks -------------------------------------------------

    pub fn save_bookmark(&mut self) -> Result<u32, Error> {
        let thread = self.current_thread()?;
        let token = self.current().stack.top().get_bookmark(thread)?;
        let pc = self.thread_pc(thread)?;
        let location = self.symbols.line_at(pc).map(|l| l.location());
        let number = self.bookmarks.save(token, pc, location);
        sd_debug!(target: "debugger", "bookmark {number} saved at {pc:#x}");
        Ok(number)
    }

    /// Delete a bookmark, or all of them.
    pub fn delete_bookmark(&mut self, number: Option<u32>) -> Result<(), Error> {
        match number {
            Some(number) => self.bookmarks.delete(number).map(|_| ()),
            None => {
                self.bookmarks.delete_all();
                Ok(())
            }
        }
    }

    /// Go to a saved bookmark (by number) or to the `start`/`begin`/`end` of the history.
    pub fn goto_bookmark(&mut self, spec: &str) -> Result<StopOutcome, Error> {
        let spec = spec.trim();
        let token = match spec {
            "start" | "begin" | "end" => spec.as_bytes().to_vec(),
            number => {
                let number: u32 = number.trim_start_matches('$').parse().map_err(|_| {
                    Error::InvalidArgument(format!("invalid bookmark: {number}"))
                })?;
                self.bookmarks
                    .get(number)
                    .ok_or(Error::BookmarkNotFound(number))?
                    .token
                    .clone()
            }
        };
        let thread = self.current_thread()?;
        self.ensure_stopped(thread)?;
        self.current().stack.top().goto_bookmark(&token, thread)?;
        self.invalidate_state(thread.pid);
        self.clear_step_state(thread);
        let pc = self.thread_pc(thread)?;
        self.normal_stop(StopOutcome {
            ptid: thread,
            pc: Some(pc),
            location: None,
            reason: StopReason::LocationReached,
        })
    }

    pub fn info_bookmarks(&self) -> Vec<Bookmark> {
        self.bookmarks.iter().cloned().collect()
    }

    // --------------------------------- introspection ---------------------------------------------

    pub fn info_target_stack(&self) -> Vec<LayerInfo> {
        self.current().stack.layers()
    }

    pub fn info_threads(&mut self) -> Result<Vec<ThreadSnapshot>, Error> {
        let pid = self.current_pid()?;
        let selected = self.current_thread().ok();
        let ptids = self.current().threads.ptids();
        let mut rows = Vec::with_capacity(ptids.len());
        for ptid in ptids {
            let pc = weak_error!(self.thread_pc(ptid), "read pc:");
            let target_id = self.current().stack.top().pid_to_str(ptid);
            let Some(info) = self.thread(ptid) else {
                continue;
            };
            debug_assert_eq!(info.ptid.pid, pid);
            rows.push(ThreadSnapshot {
                num: info.num,
                ptid,
                target_id,
                state: info.state,
                pc,
                selected: selected == Some(ptid),
            });
        }
        Ok(rows)
    }

    /// Select a unit by its user visible number.
    pub fn select_thread(&mut self, num: u32) -> Result<Ptid, Error> {
        self.current_pid()?;
        let ptid = self
            .current()
            .threads
            .iter()
            .find(|t| t.num == num)
            .map(|t| t.ptid)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown thread number {num}")))?;
        self.selected_thread = Some(ptid);
        Ok(ptid)
    }

    pub fn selected_thread(&self) -> Option<Ptid> {
        self.current_thread().ok()
    }

    pub fn backtrace(&mut self) -> Result<Vec<FrameInfo>, Error> {
        let thread = self.current_thread()?;
        self.frames(thread)
    }

    pub fn pc(&mut self) -> Result<CoreAddr, Error> {
        let thread = self.current_thread()?;
        self.thread_pc(thread)
    }

    pub fn read_register(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let thread = self.current_thread()?;
        let regs = self.thread_registers(thread)?;
        regs.get(name)
            .map(|raw| raw.to_vec())
            .ok_or_else(|| Error::RegisterNameNotFound(name.to_string()))
    }

    pub fn write_register(&mut self, name: &str, value: u64) -> Result<(), Error> {
        let thread = self.current_thread()?;
        let size = self
            .thread_registers(thread)?
            .get(name)
            .map(|raw| raw.len())
            .ok_or_else(|| Error::RegisterNameNotFound(name.to_string()))?;
        let mut bytes = value.to_le_bytes().to_vec();
        bytes.resize(size, 0);
        self.store_register(thread, name, &bytes)
    }

    pub fn read_memory(&mut self, addr: CoreAddr, len: usize) -> Result<Vec<u8>, Error> {
        self.read_memory_object(TargetObject::Memory, addr, len)
    }

    pub fn read_memory_object(
        &mut self,
        object: TargetObject,
        addr: CoreAddr,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        let inf = self.current_mut();
        inf.memory.read(&inf.stack, object, addr, &mut buf)?;
        Ok(buf)
    }

    pub fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<(), Error> {
        let inf = self.current_mut();
        inf.memory.write(&inf.stack, TargetObject::Memory, addr, data)
    }

    // --------------------------------- memory regions and overlays -------------------------------

    pub fn add_mem_region(
        &mut self,
        low: CoreAddr,
        high: CoreAddr,
        access: MemAccess,
        cacheable: bool,
    ) -> Result<u32, Error> {
        self.current_mut()
            .memory
            .regions_mut()
            .add(low, high, access, cacheable)
    }

    pub fn delete_mem_region(&mut self, number: Option<u32>) -> Result<(), Error> {
        let regions = self.current_mut().memory.regions_mut();
        match number {
            Some(number) => regions.delete(number),
            None => {
                regions.clear();
                Ok(())
            }
        }
    }

    pub fn enable_mem_region(&mut self, number: u32, enabled: bool) -> Result<(), Error> {
        self.current_mut()
            .memory
            .regions_mut()
            .set_enabled(number, enabled)
    }

    pub fn mem_regions(&self) -> Vec<MemRegion> {
        self.current().memory.regions().iter().cloned().collect()
    }

    pub fn map_overlay(&mut self, section: &str) {
        self.current_mut().memory.map_overlay(section)
    }

    pub fn unmap_overlay(&mut self, section: &str) {
        self.current_mut().memory.unmap_overlay(section)
    }

    // --------------------------------- breakpoints -----------------------------------------------

    pub fn set_breakpoint(&mut self, location: &str) -> Result<u32, Error> {
        let addr = self.resolve_location(location)?;
        let number = self.breakpoints.add_user(addr);
        sd_debug!(target: "debugger", "breakpoint {number} at {addr:#x}");
        Ok(number)
    }

    pub fn remove_breakpoint(&mut self, number: u32) -> Result<(), Error> {
        self.breakpoints.remove(number).map(|_| ())
    }

    pub fn enable_breakpoint(&mut self, number: u32, enabled: bool) -> Result<(), Error> {
        self.breakpoints.set_enabled(number, enabled)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.user_breakpoints().cloned().collect()
    }

    // --------------------------------- virtual units ---------------------------------------------

    /// Push the task overlay on the current process: units become the tasks of the program
    /// run-time instead of its physical contexts.
    pub fn enable_task_overlay(
        &mut self,
        layout: RuntimeLayout,
        access: impl TaskRegisterAccess + 'static,
    ) -> Result<(), Error> {
        let pid = self.current_pid()?;
        let layer = TaskTarget::new(layout, Box::new(access));
        self.push_target(TargetRef::new(layer))?;
        self.invalidate_state(pid);
        self.update_thread_list(pid)?;
        if self.selected_thread.and_then(|t| self.thread(t)).is_none() {
            self.selected_thread = self.current().threads.first();
        }
        Ok(())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        for id in self.sig_ids.drain(..) {
            event::uninstall_handler(id);
        }
        let processes: Vec<(i32, bool)> = self
            .inferiors
            .iter()
            .filter_map(|inf| inf.pid.map(|pid| (pid, inf.attached)))
            .collect();
        for (pid, attached) in processes {
            self.remove_breakpoints(pid);
            let Ok(idx) = self.inferior_index(pid) else {
                continue;
            };
            let top = self.inferiors[idx].stack.top();
            if attached {
                weak_error!(top.detach(pid), "detach on exit:");
            } else {
                weak_error!(top.kill(pid), "kill on exit:");
            }
        }
    }
}
