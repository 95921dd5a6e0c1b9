mod common;

mod events;
mod native;
mod record;
mod signals;
mod stack;
mod steps;
mod tasks;

use crate::common::{started, MAIN};
use strata::debugger::StopReason;

#[test]
fn test_start_stops_at_entry() {
    let mut session = started(&[MAIN]);
    assert_eq!(session.debugger.pc().unwrap(), MAIN);
    assert_eq!(session.info.new_threads.borrow().len(), 1);
    assert_eq!(session.sim.state().resumes, 0);
}

#[test]
fn test_run_to_exit() {
    let mut session = common::sim_debugger(&[MAIN]);
    let outcome = session.debugger.run().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
    assert_eq!(session.info.exit_code.get(), Some(22));
    assert_eq!(session.debugger.current_inferior().pid(), None);
    assert!(session.debugger.pc().is_err());

    // the sim layer is gone with the process, the next run creates a fresh one
    let outcome = session.debugger.run().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
}

#[test]
fn test_start_twice_is_refused() {
    let mut session = started(&[MAIN]);
    assert!(session.debugger.start().is_err());
}

#[test]
fn test_kill_forgets_process() {
    let mut session = started(&[MAIN]);
    session.debugger.kill().unwrap();
    assert!(session.sim.state().killed);
    assert_eq!(session.debugger.current_inferior().pid(), None);
    assert!(session.debugger.continue_execution().is_err());
}

#[test]
fn test_every_ui_is_notified() {
    let mut session = started(&[MAIN]);
    let second = common::TestInfo::default();
    let idx = session
        .debugger
        .add_ui(common::TestHooks::new(second.clone()));
    assert_eq!(idx, 1);
    assert!(session.debugger.switch_ui(5).is_err());
    session.debugger.switch_ui(idx).unwrap();
    assert_eq!(session.debugger.current_ui(), 1);

    session.debugger.stepi(1).unwrap();
    assert_eq!(session.info.stops.get(), 1);
    assert_eq!(second.stops.get(), 1);
    assert_eq!(second.pc.get(), Some(MAIN + 4));
}
