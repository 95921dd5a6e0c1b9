use crate::common::{started, MAIN, RESULT_ADDR};
use strata::debugger::error::Error;
use strata::debugger::target::{ExecDirection, Stratum};
use strata::debugger::StopReason;

fn r0(session: &crate::common::SimSession) -> u64 {
    session.sim.state().cpus[0].r[0]
}

#[test]
fn test_reverse_stepi() {
    let mut session = started(&[MAIN]);
    session.debugger.record_start().unwrap();
    session.debugger.stepi(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 8);
    assert_eq!(r0(&session), 2);

    let outcome = session.debugger.reverse_stepi(1).unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 4));
    assert_eq!(r0(&session), 1);
    assert_eq!(session.debugger.exec_direction(), ExecDirection::Forward);

    let outcome = session.debugger.reverse_continue().unwrap();
    assert_eq!(outcome.reason, StopReason::NoHistory);
    assert_eq!(outcome.pc, Some(MAIN));
    assert_eq!(r0(&session), 0);
}

#[test]
fn test_replay_forward_to_history_end() {
    let mut session = started(&[MAIN]);
    session.debugger.record_start().unwrap();
    session.debugger.stepi(2).unwrap();
    session.debugger.reverse_continue().unwrap();

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::NoHistory);
    assert_eq!(outcome.pc, Some(MAIN + 8));
    assert_eq!(r0(&session), 2);

    // past the history end the program runs live and is recorded again
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
    assert!(!session
        .debugger
        .current_inferior()
        .stack()
        .has_stratum(Stratum::Record));
}

#[test]
fn test_reverse_undoes_memory_writes() {
    let mut session = started(&[MAIN]);
    session.debugger.set_breakpoint("main.c:14").unwrap();
    session.debugger.record_start().unwrap();

    session.debugger.continue_execution().unwrap();
    assert_eq!(session.sim.state().read_u64(RESULT_ADDR), Some(22));
    // breakpoints are handled by the record layer, program code is untouched
    assert_eq!(session.sim.state().mem[0x1014], crate::common::sim::HALT);

    session.debugger.reverse_stepi(1).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0x10);
    assert_eq!(session.sim.state().read_u64(RESULT_ADDR), Some(0));
    assert_eq!(
        session.debugger.read_memory(RESULT_ADDR, 8).unwrap(),
        vec![0; 8]
    );
}

#[test]
fn test_reverse_step_over_call() {
    let mut session = started(&[MAIN]);
    session.debugger.record_start().unwrap();
    session.debugger.next(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0xC);

    // back over the whole call of inc
    let outcome = session.debugger.reverse_next(1).unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 0x8));
    assert_eq!(session.info.line.get(), Some(11));
    assert_eq!(r0(&session), 2);
}

#[test]
fn test_bookmarks() {
    let mut session = started(&[MAIN]);
    session.debugger.record_start().unwrap();
    session.debugger.stepi(2).unwrap();
    let number = session.debugger.save_bookmark().unwrap();
    assert_eq!(number, 1);
    let bookmarks = session.debugger.info_bookmarks();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].pc, MAIN + 8);

    let outcome = session.debugger.goto_bookmark("start").unwrap();
    assert_eq!(outcome.reason, StopReason::LocationReached);
    assert_eq!(outcome.pc, Some(MAIN));
    assert_eq!(r0(&session), 0);

    // no writes while the history is replayed
    assert!(matches!(
        session.debugger.write_register("r0", 5),
        Err(Error::Refused { .. })
    ));
    assert!(session.debugger.write_memory(RESULT_ADDR, &[1]).is_err());

    let outcome = session.debugger.goto_bookmark("$1").unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 8));
    assert_eq!(r0(&session), 2);

    session.debugger.goto_bookmark("begin").unwrap();
    session.debugger.goto_bookmark("end").unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 8);

    assert!(matches!(
        session.debugger.goto_bookmark("7"),
        Err(Error::BookmarkNotFound(7))
    ));
    assert!(session.debugger.goto_bookmark("soon").is_err());

    session.debugger.delete_bookmark(Some(number)).unwrap();
    assert!(session.debugger.delete_bookmark(Some(number)).is_err());
    assert!(session.debugger.info_bookmarks().is_empty());
}

#[test]
fn test_record_stop_keeps_replay_position() {
    let mut session = started(&[MAIN]);
    session.debugger.record_start().unwrap();
    session.debugger.stepi(2).unwrap();
    session.debugger.reverse_stepi(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN);

    session.debugger.record_stop().unwrap();
    assert!(session.debugger.record_stop().is_err());
    session.debugger.write_register("r0", 0).unwrap();

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
}

#[test]
fn test_reverse_needs_recording() {
    let mut session = started(&[MAIN]);
    assert!(matches!(
        session.debugger.reverse_stepi(1),
        Err(Error::Unsupported(_))
    ));
    assert!(session
        .debugger
        .set_exec_direction(ExecDirection::Reverse)
        .is_err());
    assert_eq!(session.sim.state().resumes, 0);

    session.debugger.record_start().unwrap();
    assert!(matches!(
        session.debugger.record_start(),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(session.debugger.info_target_stack()[0].shortname, "record-full");
}

#[test]
fn test_bookmark_without_recording() {
    let mut session = started(&[MAIN]);
    // the process layer has no execution history to mark
    assert!(session.debugger.save_bookmark().is_err());
}
