//! Line oriented terminal front end.

pub mod command;
pub mod hook;

use crate::console::command::{Command, SignalAction, HELP};
use crate::debugger::target::Stratum;
use crate::debugger::thread::ThreadState;
use crate::debugger::Debugger;
use itertools::Itertools;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::Path;

const PROMPT: &str = "(strata) ";

pub struct ConsoleApp {
    debugger: Debugger,
    editor: DefaultEditor,
    last_command: Option<String>,
}

impl ConsoleApp {
    pub fn new(debugger: Debugger) -> anyhow::Result<Self> {
        Ok(Self {
            debugger,
            editor: DefaultEditor::new()?,
            last_command: None,
        })
    }

    pub fn debugger_mut(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        loop {
            let mut input = match self.editor.readline(PROMPT) {
                Ok(input) => input,
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            // empty line repeats the last command
            if input.trim().is_empty() {
                match self.last_command.clone() {
                    Some(last) => input = last,
                    None => continue,
                }
            } else {
                _ = self.editor.add_history_entry(&input);
                self.last_command = Some(input.clone());
            }

            let cmd = match Command::parse(&input) {
                Ok(cmd) => cmd,
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            };
            if cmd == Command::Quit {
                break;
            }
            if let Err(e) = self.handle_command(cmd) {
                println!("error: {e:#}");
            }
            // deliver whatever arrived while the command ran
            if let Err(e) = self.debugger.process_events(false) {
                println!("error: {e:#}");
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        let dbg = &mut self.debugger;
        match cmd {
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
            Command::File(path) => {
                dbg.exec_file(Path::new(&path))?;
                println!("Reading symbols from {path}");
            }
            Command::Run => {
                dbg.run()?;
            }
            Command::Start => {
                let ptid = dbg.start()?;
                println!("Started {ptid} at {:#x}", dbg.pc()?);
            }
            Command::Attach(pid) => {
                let ptid = dbg.attach(pid)?;
                println!("Attached to {ptid} at {:#x}", dbg.pc()?);
            }
            Command::Detach => dbg.detach()?,
            Command::Kill => dbg.kill()?,
            Command::Continue => {
                dbg.continue_execution()?;
            }
            Command::Step(n) => {
                dbg.step(n)?;
            }
            Command::Next(n) => {
                dbg.next(n)?;
            }
            Command::StepI(n) => {
                dbg.stepi(n)?;
            }
            Command::NextI(n) => {
                dbg.nexti(n)?;
            }
            Command::Until(None) => {
                dbg.until_next()?;
            }
            Command::Until(Some(location)) => {
                dbg.until(&location)?;
            }
            Command::Advance(location) => {
                dbg.advance(&location)?;
            }
            Command::Finish => {
                dbg.finish()?;
            }
            Command::Jump(location) => {
                dbg.jump(&location)?;
            }
            Command::Signal(signal) => {
                let elsewhere = dbg.pending_signals_elsewhere()?;
                for (ptid, signal) in elsewhere {
                    println!("Note: {ptid} has a pending signal {signal}");
                }
                dbg.signal(signal)?;
            }
            Command::QueueSignal(signal) => dbg.queue_signal(signal)?,
            Command::Handle(signal, actions) => {
                let mut policy = dbg.signal_policy(signal);
                for action in actions {
                    match action {
                        SignalAction::Stop => policy.stop = true,
                        SignalAction::NoStop => policy.stop = false,
                        SignalAction::Pass => policy.pass = true,
                        SignalAction::NoPass => policy.pass = false,
                    }
                }
                dbg.handle_signal(signal, policy);
                println!("{signal}: stop {}, pass {}", policy.stop, policy.pass);
            }
            Command::Interrupt => dbg.interrupt()?,
            Command::ReverseStep(n) => {
                dbg.reverse_step(n)?;
            }
            Command::ReverseNext(n) => {
                dbg.reverse_next(n)?;
            }
            Command::ReverseStepI(n) => {
                dbg.reverse_stepi(n)?;
            }
            Command::ReverseNextI(n) => {
                dbg.reverse_nexti(n)?;
            }
            Command::ReverseContinue => {
                dbg.reverse_continue()?;
            }
            Command::ReverseFinish => {
                dbg.reverse_finish()?;
            }
            Command::Record => dbg.record_start()?,
            Command::RecordStop => dbg.record_stop()?,
            Command::Bookmark => {
                let number = dbg.save_bookmark()?;
                println!("Saved bookmark {number}");
            }
            Command::DeleteBookmark(number) => dbg.delete_bookmark(number)?,
            Command::GotoBookmark(spec) => {
                dbg.goto_bookmark(&spec)?;
            }
            Command::Bookmarks => {
                for b in dbg.info_bookmarks() {
                    let location = b.location.map(|l| l.to_string()).unwrap_or_default();
                    println!("{:<4} {:#018x} {location}", b.number, b.pc);
                }
            }
            Command::Break(location) => {
                let number = dbg.set_breakpoint(&location)?;
                println!("Breakpoint {number} at {location}");
            }
            Command::Delete(number) => dbg.remove_breakpoint(number)?,
            Command::Enable(number) => dbg.enable_breakpoint(number, true)?,
            Command::Disable(number) => dbg.enable_breakpoint(number, false)?,
            Command::Breakpoints => {
                for bp in dbg.breakpoints() {
                    let state = if bp.enabled { "y" } else { "n" };
                    println!(
                        "{:<4} {state} {:#018x} hits: {}",
                        bp.number, bp.addr, bp.hit_count
                    );
                }
            }
            Command::Threads => {
                for t in dbg.info_threads()? {
                    let mark = if t.selected { "*" } else { " " };
                    let state = match t.state {
                        ThreadState::Stopped => "stopped",
                        ThreadState::Running => "running",
                        ThreadState::Exited => "exited",
                    };
                    let pc = t.pc.map(|pc| format!("{pc:#x}")).unwrap_or_default();
                    println!("{mark} {:<4} {:<24} {state:<8} {pc}", t.num, t.target_id);
                }
            }
            Command::Thread(num) => {
                let ptid = dbg.select_thread(num)?;
                println!("Switching to thread {num} ({ptid})");
            }
            Command::Backtrace => {
                for frame in dbg.backtrace()? {
                    let function = frame
                        .function
                        .map(|f| f.name)
                        .unwrap_or_else(|| "??".to_string());
                    println!("#{:<3} {:#018x} in {function} [{}]", frame.level, frame.pc, frame.kind);
                }
            }
            Command::Registers(name) => {
                let bytes = dbg.read_register(&name)?;
                println!("{name} = 0x{}", bytes.iter().rev().map(|b| format!("{b:02x}")).join(""));
            }
            Command::SetRegister(name, value) => dbg.write_register(&name, value)?,
            Command::ExamineMemory(addr, len) => {
                let bytes = dbg.read_memory(addr, len)?;
                for (i, chunk) in bytes.chunks(16).enumerate() {
                    let line = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
                    println!("{:#018x}: {line}", addr + i as u64 * 16);
                }
            }
            Command::WriteMemory(addr, bytes) => dbg.write_memory(addr, &bytes)?,
            Command::MemRegion(low, high, access) => {
                let number = dbg.add_mem_region(low, high, access, true)?;
                println!("Memory region {number}: [{low:#x}, {high:#x}) {access}");
            }
            Command::DeleteMemRegion(number) => dbg.delete_mem_region(number)?,
            Command::EnableMemRegion(number) => dbg.enable_mem_region(number, true)?,
            Command::DisableMemRegion(number) => dbg.enable_mem_region(number, false)?,
            Command::MemRegions => {
                for r in dbg.mem_regions() {
                    let state = if r.enabled { "y" } else { "n" };
                    println!(
                        "{:<4} {state} {:#018x} {:#018x} {}",
                        r.number, r.low, r.high, r.access
                    );
                }
            }
            Command::OverlayMap(section) => dbg.map_overlay(&section),
            Command::OverlayUnmap(section) => dbg.unmap_overlay(&section),
            Command::TargetStack => {
                for layer in dbg.info_target_stack() {
                    if layer.stratum == Stratum::Dummy {
                        println!("  - {} (None)", layer.shortname);
                    } else {
                        println!("  - {} ({})", layer.shortname, layer.longname);
                    }
                }
            }
            Command::Inferiors => {
                let current = dbg.current_inferior().num();
                for inf in dbg.inferiors() {
                    let mark = if inf.num() == current { "*" } else { " " };
                    let pid = inf
                        .pid()
                        .map(|pid| format!("process {pid}"))
                        .unwrap_or_else(|| "<null>".to_string());
                    let program = inf
                        .program()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    println!("{mark} {:<4} {pid:<16} {program}", inf.num());
                }
            }
            Command::AddInferior => {
                let num = dbg.add_inferior(true)?;
                println!("Added inferior {num}");
            }
            Command::Inferior(num) => dbg.switch_inferior(num)?,
            Command::RemoveInferior(num) => dbg.remove_inferior(num)?,
        }
        Ok(())
    }
}
