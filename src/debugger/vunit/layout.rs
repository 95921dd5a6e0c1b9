use crate::debugger::error::Error;
use crate::debugger::register::RegisterCache;
use crate::debugger::target::TargetMemory;
use crate::debugger::CoreAddr;
use std::collections::HashSet;

/// Upper bound of the task list walk, a corrupted list must not hang the debugger.
const MAX_TASKS: usize = 4096;

/// Where the program run-time keeps its scheduling state.
///
/// Cpus are numbered from 1. A task is identified by the address of its control block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeLayout {
    /// Table with one pointer per cpu: control block of the task running on the cpu, or zero.
    pub running_table: CoreAddr,
    pub cpu_count: u32,
    /// Pointer to the first control block of the list of all tasks.
    pub task_list: CoreAddr,
    /// Offset of the pointer to the next control block of the list.
    pub next_offset: u64,
    /// Offset of the `u32` number of the cpu the task is assigned to.
    pub cpu_offset: u64,
    /// Offset of the block the task registers are saved into when it is switched out.
    pub context_offset: u64,
}

impl RuntimeLayout {
    /// Control block of the task running on the cpu.
    pub fn running_task(
        &self,
        mem: &mut dyn TargetMemory,
        cpu: u32,
    ) -> Result<Option<CoreAddr>, Error> {
        if cpu == 0 || cpu > self.cpu_count {
            return Err(Error::InvalidArgument(format!("no cpu number {cpu}")));
        }
        let slot = self.running_table + (cpu as u64 - 1) * 8;
        let task = mem.read_u64(slot)?;
        Ok((task != 0).then_some(task))
    }

    /// Control blocks of all tasks, in list order.
    pub fn tasks(&self, mem: &mut dyn TargetMemory) -> Result<Vec<CoreAddr>, Error> {
        let mut tasks = vec![];
        let mut seen = HashSet::new();
        let mut current = mem.read_u64(self.task_list)?;
        while current != 0 && seen.insert(current) && tasks.len() < MAX_TASKS {
            tasks.push(current);
            current = mem.read_u64(current + self.next_offset)?;
        }
        Ok(tasks)
    }

    pub fn task_cpu(&self, mem: &mut dyn TargetMemory, task: CoreAddr) -> Result<u32, Error> {
        mem.read_u32(task + self.cpu_offset)
    }

    pub fn context_addr(&self, task: CoreAddr) -> CoreAddr {
        task + self.context_offset
    }
}

/// Reads and writes registers of a task that is not running, from its saved context block.
pub trait TaskRegisterAccess {
    fn fetch_registers(
        &self,
        mem: &mut dyn TargetMemory,
        context: CoreAddr,
        regs: &mut RegisterCache,
    ) -> Result<(), Error>;

    fn store_registers(
        &self,
        mem: &mut dyn TargetMemory,
        context: CoreAddr,
        regs: &RegisterCache,
    ) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSlot {
    pub register: &'static str,
    pub offset: u64,
    pub size: usize,
}

/// Saved context as a list of register slots. Registers without a slot are not saved by the
/// context switch and stay unavailable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedContextLayout {
    slots: Vec<ContextSlot>,
}

impl SavedContextLayout {
    pub fn new(slots: Vec<ContextSlot>) -> Self {
        Self { slots }
    }

    /// Consecutive 8-byte slots in the given register order.
    pub fn sequential(registers: &[&'static str]) -> Self {
        Self::new(
            registers
                .iter()
                .enumerate()
                .map(|(idx, register)| ContextSlot {
                    register,
                    offset: idx as u64 * 8,
                    size: 8,
                })
                .collect(),
        )
    }

    /// Callee saved registers, as a typical x86-64 context switch stores them.
    pub fn x86_64() -> Self {
        Self::sequential(&["rbx", "rsp", "rbp", "r12", "r13", "r14", "r15", "rip"])
    }
}

impl TaskRegisterAccess for SavedContextLayout {
    fn fetch_registers(
        &self,
        mem: &mut dyn TargetMemory,
        context: CoreAddr,
        regs: &mut RegisterCache,
    ) -> Result<(), Error> {
        for slot in &self.slots {
            let mut buf = vec![0; slot.size];
            mem.read_memory(context + slot.offset, &mut buf)?;
            regs.supply(slot.register, &buf);
        }
        Ok(())
    }

    fn store_registers(
        &self,
        mem: &mut dyn TargetMemory,
        context: CoreAddr,
        regs: &RegisterCache,
    ) -> Result<(), Error> {
        for slot in &self.slots {
            let Some(value) = regs.get(slot.register) else {
                continue;
            };
            let mut buf = value.to_vec();
            buf.resize(slot.size, 0);
            mem.write_memory(context + slot.offset, &buf)?;
        }
        Ok(())
    }
}
