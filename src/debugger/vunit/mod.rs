//! Task overlay: a layer that shows the tasks of a program run-time as execution units, on top
//! of a layer that only knows the cpus the tasks are scheduled on.
//!
//! A cpu is the unit `(pid, cpu, 0)` of the layer beneath, a task is the unit
//! `(pid, 0, control block address)`. Registers of a task that runs on its cpu are the live cpu
//! registers, registers of any other task come from its saved context block.

mod layout;

pub use layout::{ContextSlot, RuntimeLayout, SavedContextLayout, TaskRegisterAccess};

use crate::debugger::error::Error;
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::target::{
    Beneath, ResumeRequest, Stratum, Target, WaitOptions, WaitStatus,
};
use crate::debugger::CoreAddr;
use crate::{muted_error, sd_debug, sd_trace};
use std::collections::HashMap;

/// Where the registers of a task are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegisterHome {
    Cpu(Ptid),
    Saved(CoreAddr),
}

pub struct TaskTarget {
    layout: RuntimeLayout,
    access: Box<dyn TaskRegisterAccess>,
    /// Cpu each task was last seen on. Looked up before the run-time tables.
    cpu_map: HashMap<u64, i64>,
    pid: Option<i32>,
}

impl TaskTarget {
    pub fn new(layout: RuntimeLayout, access: Box<dyn TaskRegisterAccess>) -> Self {
        Self {
            layout,
            access,
            cpu_map: HashMap::new(),
            pid: None,
        }
    }

    fn read_task_cpu(&self, beneath: Beneath<'_>, task: u64) -> Result<i64, Error> {
        let mut mem = beneath;
        Ok(self.layout.task_cpu(&mut mem, task)? as i64)
    }

    /// Cpu unit of a task, from the cache when possible.
    fn cpu_of(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<Ptid, Error> {
        if !ptid.is_virtual() {
            return Ok(ptid);
        }
        let cpu = match self.cpu_map.get(&ptid.tid) {
            Some(cpu) => *cpu,
            None => {
                let cpu = self.read_task_cpu(beneath, ptid.tid)?;
                self.cpu_map.insert(ptid.tid, cpu);
                cpu
            }
        };
        Ok(Ptid::new(ptid.pid, cpu, 0))
    }

    /// Same as [`Self::cpu_of`] for shared access, the cache is not updated.
    fn peek_cpu_of(&self, beneath: Beneath<'_>, ptid: Ptid) -> Option<Ptid> {
        if !ptid.is_virtual() {
            return Some(ptid);
        }
        let cpu = match self.cpu_map.get(&ptid.tid) {
            Some(cpu) => *cpu,
            None => muted_error!(self.read_task_cpu(beneath, ptid.tid))?,
        };
        Some(Ptid::new(ptid.pid, cpu, 0))
    }

    fn active_task(&self, beneath: Beneath<'_>, cpu: Ptid) -> Result<Option<u64>, Error> {
        let mut mem = beneath;
        self.layout.running_task(&mut mem, cpu.lwp as u32)
    }

    fn register_home(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<RegisterHome, Error> {
        if !ptid.is_virtual() {
            return Ok(RegisterHome::Cpu(ptid));
        }
        let cpu = self.cpu_of(beneath, ptid)?;
        let home = if self.active_task(beneath, cpu)? == Some(ptid.tid) {
            RegisterHome::Cpu(cpu)
        } else {
            RegisterHome::Saved(self.layout.context_addr(ptid.tid))
        };
        sd_trace!(target: "vunit", "registers of {ptid}: {home:?}");
        Ok(home)
    }

    fn to_cpu_filter(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<Ptid, Error> {
        if ptid.is_virtual() {
            self.cpu_of(beneath, ptid)
        } else {
            Ok(ptid)
        }
    }
}

impl Target for TaskTarget {
    fn shortname(&self) -> &'static str {
        "tasks"
    }

    fn longname(&self) -> String {
        format!("tasks of the program run-time ({} cpus)", self.layout.cpu_count)
    }

    fn stratum(&self) -> Stratum {
        Stratum::Thread
    }

    fn close(&mut self) {
        self.cpu_map.clear();
    }

    fn fetch_registers(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        regs: &mut RegisterCache,
    ) -> Result<(), Error> {
        match self.register_home(beneath, ptid)? {
            RegisterHome::Cpu(cpu) => beneath.fetch_registers(cpu, regs),
            RegisterHome::Saved(context) => {
                let mut mem = beneath;
                self.access.fetch_registers(&mut mem, context, regs)
            }
        }
    }

    fn store_registers(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        match self.register_home(beneath, ptid)? {
            RegisterHome::Cpu(cpu) => beneath.store_registers(cpu, regs),
            RegisterHome::Saved(context) => {
                let mut mem = beneath;
                self.access.store_registers(&mut mem, context, regs)
            }
        }
    }

    fn resume(&mut self, beneath: Beneath<'_>, req: ResumeRequest) -> Result<(), Error> {
        let req = ResumeRequest {
            scope: self.to_cpu_filter(beneath, req.scope)?,
            thread: self.to_cpu_filter(beneath, req.thread)?,
            ..req
        };
        beneath.resume(req)
    }

    fn wait(
        &mut self,
        beneath: Beneath<'_>,
        ptid: Ptid,
        opts: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        let filter = self.to_cpu_filter(beneath, ptid)?;
        let Some((cpu, status)) = beneath.wait(filter, opts)? else {
            return Ok(None);
        };
        match status {
            WaitStatus::Exited(_) | WaitStatus::Signalled(_) => {
                self.cpu_map.clear();
                Ok(Some((cpu, status)))
            }
            _ if cpu.is_process() || cpu.is_virtual() => Ok(Some((cpu, status))),
            _ => match self.active_task(beneath, cpu)? {
                Some(task) => {
                    self.cpu_map.insert(task, cpu.lwp);
                    let ptid = Ptid::new(cpu.pid, 0, task);
                    sd_debug!(target: "vunit", "{cpu} stopped running {ptid}");
                    Ok(Some((ptid, status)))
                }
                // idle cpu
                None => Ok(Some((cpu, status))),
            },
        }
    }

    fn stop(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<(), Error> {
        let filter = self.to_cpu_filter(beneath, ptid)?;
        beneath.stop(filter)
    }

    fn create_inferior(
        &mut self,
        beneath: Beneath<'_>,
        program: &std::path::Path,
        args: &[String],
    ) -> Result<Ptid, Error> {
        self.cpu_map.clear();
        let ptid = beneath.create_inferior(program, args)?;
        self.pid = Some(ptid.pid);
        Ok(ptid)
    }

    fn mourn_inferior(&mut self, beneath: Beneath<'_>, pid: i32) {
        self.cpu_map.clear();
        self.pid = None;
        beneath.mourn_inferior(pid)
    }

    /// Tasks never exit while the process lives.
    fn thread_alive(&self, beneath: Beneath<'_>, ptid: Ptid) -> bool {
        if ptid.is_virtual() {
            return self.pid.map(|pid| pid == ptid.pid).unwrap_or(true) && beneath.has_execution();
        }
        beneath.thread_alive(ptid)
    }

    fn update_thread_list(
        &mut self,
        beneath: Beneath<'_>,
        list: &mut Vec<Ptid>,
    ) -> Result<(), Error> {
        let mut cpus = vec![];
        beneath.update_thread_list(&mut cpus)?;
        let Some(pid) = cpus.first().map(|p| p.pid).or(self.pid) else {
            return Ok(());
        };
        self.pid = Some(pid);

        let mut mem = beneath;
        let tasks = match self.layout.tasks(&mut mem) {
            Ok(tasks) if !tasks.is_empty() => tasks,
            // run-time is not initialized yet
            Ok(_) => {
                list.extend(cpus);
                return Ok(());
            }
            Err(e) => {
                sd_debug!(target: "vunit", "read task list: {e}");
                list.extend(cpus);
                return Ok(());
            }
        };
        list.extend(tasks.into_iter().map(|task| Ptid::new(pid, 0, task)));
        Ok(())
    }

    fn pid_to_str(&self, beneath: Beneath<'_>, ptid: Ptid) -> String {
        if !ptid.is_virtual() {
            return beneath.pid_to_str(ptid);
        }
        match self.cpu_map.get(&ptid.tid) {
            Some(cpu) => format!("Task {:#x} (cpu {cpu})", ptid.tid),
            None => format!("Task {:#x}", ptid.tid),
        }
    }

    fn stopped_by_sw_breakpoint(&self, beneath: Beneath<'_>, ptid: Ptid) -> bool {
        match self.peek_cpu_of(beneath, ptid) {
            Some(cpu) => beneath.stopped_by_sw_breakpoint(cpu),
            None => false,
        }
    }

    fn get_bookmark(&mut self, beneath: Beneath<'_>, ptid: Ptid) -> Result<Vec<u8>, Error> {
        let cpu = self.to_cpu_filter(beneath, ptid)?;
        beneath.get_bookmark(cpu)
    }

    fn goto_bookmark(
        &mut self,
        beneath: Beneath<'_>,
        token: &[u8],
        ptid: Ptid,
    ) -> Result<(), Error> {
        let cpu = self.to_cpu_filter(beneath, ptid)?;
        beneath.goto_bookmark(token, cpu)
    }
}
