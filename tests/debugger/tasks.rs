use crate::common::sim::{cpu_ptid, insn, Sim, ADDI, JMP, STORE};
use crate::common::{sim_debugger, started, MAIN, SPIN};
use strata::debugger::ptid::Ptid;
use strata::debugger::thread::ThreadState;
use strata::debugger::vunit::{RuntimeLayout, SavedContextLayout};
use strata::debugger::StopReason;

const RUNNING_TABLE: u64 = 0x9000;
const TASK_LIST: u64 = 0x9100;
const TASK_A: u64 = 0xA000;
const TASK_B: u64 = 0xA100;
const SAVED_PC: u64 = 0x1234;
/// Code that switches cpu 1 from task A to task B.
const SWITCH: u64 = 0x1400;

fn layout() -> RuntimeLayout {
    RuntimeLayout {
        running_table: RUNNING_TABLE,
        cpu_count: 2,
        task_list: TASK_LIST,
        next_offset: 0,
        cpu_offset: 8,
        context_offset: 16,
    }
}

fn put_u32(sim: &Sim, addr: u64, value: u32) {
    let start = addr as usize;
    sim.state_mut().mem[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

/// Task A runs on cpu 1, task B waits for cpu 2 which is idle.
fn write_run_time(sim: &Sim) {
    let mut state = sim.state_mut();
    state.write_u64(RUNNING_TABLE, TASK_A);
    state.write_u64(RUNNING_TABLE + 8, 0);
    state.write_u64(TASK_LIST, TASK_A);
    state.write_u64(TASK_A, TASK_B);
    state.write_u64(TASK_B, 0);
    state.write_u64(TASK_B + 16, SAVED_PC);
    state.write_u64(TASK_B + 24, 0xE000);
    drop(state);
    put_u32(sim, TASK_A + 8, 1);
    put_u32(sim, TASK_B + 8, 2);
}

fn task(tcb: u64) -> Ptid {
    Ptid::new(cpu_ptid(0).pid, 0, tcb)
}

#[test]
fn test_tasks_replace_cpus() {
    let mut session = started(&[MAIN, SPIN]);
    write_run_time(&session.sim);
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();

    let threads = session.debugger.info_threads().unwrap();
    let ptids: Vec<_> = threads.iter().map(|t| t.ptid).collect();
    assert_eq!(ptids, vec![task(TASK_A), task(TASK_B)]);
    assert!(threads.iter().all(|t| t.state == ThreadState::Stopped));

    // running task shows its cpu registers, the waiting one its saved context
    assert_eq!(threads[0].pc, Some(MAIN));
    assert_eq!(threads[1].pc, Some(SAVED_PC));
    assert_eq!(threads[0].target_id, "Task 0xa000 (cpu 1)");
    assert_eq!(threads[1].target_id, "Task 0xa100 (cpu 2)");
    assert!(threads[0].selected);

    let stack = session.debugger.info_target_stack();
    assert_eq!(stack[0].shortname, "tasks");
    assert!(session
        .info
        .new_threads
        .borrow()
        .contains(&task(TASK_B)));
}

#[test]
fn test_step_running_task() {
    let mut session = started(&[MAIN, SPIN]);
    write_run_time(&session.sim);
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();

    let outcome = session.debugger.stepi(1).unwrap();
    assert_eq!(outcome.ptid, task(TASK_A));
    assert_eq!(outcome.pc, Some(MAIN + 4));
    assert_eq!(session.sim.state().cpus[0].pc, MAIN + 4);
    // the other cpu stays where it was
    assert_eq!(session.sim.state().cpus[1].pc, SPIN);
    assert_eq!(session.sim.state().resumes, 1);
}

#[test]
fn test_saved_context_registers() {
    let mut session = started(&[MAIN, SPIN]);
    write_run_time(&session.sim);
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();

    let num = session
        .debugger
        .info_threads()
        .unwrap()
        .into_iter()
        .find(|t| t.ptid == task(TASK_B))
        .map(|t| t.num)
        .unwrap();
    session.debugger.select_thread(num).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), SAVED_PC);

    session.debugger.write_register("pc", SPIN).unwrap();
    assert_eq!(session.sim.state().read_u64(TASK_B + 16), Some(SPIN));
    // the cpu the task is assigned to is not touched
    assert_eq!(session.sim.state().cpus[1].pc, SPIN);
    assert_eq!(session.sim.state().cpus[0].pc, MAIN);

    // registers the context switch does not save are unavailable
    assert!(session.debugger.read_register("r0").is_err());
}

#[test]
fn test_task_stop_is_reported_for_running_task() {
    let mut session = started(&[MAIN, SPIN]);
    write_run_time(&session.sim);
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();

    let number = session.debugger.set_breakpoint("main.c:12").unwrap();
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(vec![number]));
    assert_eq!(outcome.ptid, task(TASK_A));
}

#[test]
fn test_uninitialized_run_time_shows_cpus() {
    let mut session = started(&[MAIN, SPIN]);
    // empty task list
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();
    let ptids: Vec<_> = session
        .debugger
        .info_threads()
        .unwrap()
        .into_iter()
        .map(|t| t.ptid)
        .collect();
    assert_eq!(ptids, vec![cpu_ptid(0), cpu_ptid(1)]);
}

#[test]
fn test_context_switch_moves_registers() {
    let mut session = sim_debugger(&[SWITCH, SPIN]);
    session.sim.load(
        SWITCH,
        &[
            insn(ADDI, 1, TASK_B as u16),
            insn(STORE, 1, RUNNING_TABLE as u16),
            insn(ADDI, 2, 1),
            insn(STORE, 2, (TASK_B + 8) as u16),
            insn(JMP, 0, (SWITCH + 0x10) as u16),
        ],
    );
    session.debugger.start().unwrap();
    write_run_time(&session.sim);
    {
        let mut state = session.sim.state_mut();
        state.write_u64(TASK_A + 16, 0x4444);
        state.write_u64(TASK_A + 24, 0xE100);
    }
    session
        .debugger
        .enable_task_overlay(layout(), SavedContextLayout::sequential(&["pc", "sp"]))
        .unwrap();

    let pcs: Vec<_> = session
        .debugger
        .info_threads()
        .unwrap()
        .into_iter()
        .map(|t| (t.ptid, t.pc))
        .collect();
    assert_eq!(
        pcs,
        vec![(task(TASK_A), Some(SWITCH)), (task(TASK_B), Some(SAVED_PC))]
    );

    let number = session.debugger.set_breakpoint("*0x1410").unwrap();
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(vec![number]));
    // the cpu now runs task B
    assert_eq!(outcome.ptid, task(TASK_B));
    assert_eq!(outcome.pc, Some(SWITCH + 0x10));

    let threads = session.debugger.info_threads().unwrap();
    let pcs: Vec<_> = threads.iter().map(|t| (t.ptid, t.pc)).collect();
    assert_eq!(
        pcs,
        vec![(task(TASK_A), Some(0x4444)), (task(TASK_B), Some(SWITCH + 0x10))]
    );
    assert_eq!(threads[1].target_id, "Task 0xa100 (cpu 1)");

    // writes follow the new homes: A goes to its saved context, B to the cpu
    let num_a = threads[0].num;
    session.debugger.select_thread(num_a).unwrap();
    session.debugger.write_register("pc", MAIN).unwrap();
    assert_eq!(session.sim.state().read_u64(TASK_A + 16), Some(MAIN));
    assert_eq!(session.sim.state().cpus[0].pc, SWITCH + 0x10);
}
