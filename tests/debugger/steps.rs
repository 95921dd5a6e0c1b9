use crate::assert_reason;
use crate::common::sim::SimUnwinder;
use crate::common::{sim_debugger_with, started, MockSymbols, SimSession, INC, MAIN, SPIN};
use strata::debugger::arch::FrameKind;
use strata::debugger::error::Error;
use strata::debugger::StopReason;

/// Function that tail-called `inc`.
const MID: u64 = 0x1500;

fn started_with(
    extend: impl FnOnce(MockSymbols) -> MockSymbols,
    unwinder: SimUnwinder,
) -> SimSession {
    let mut session = sim_debugger_with(&[MAIN], extend, unwinder);
    session.debugger.start().unwrap();
    session
}

#[test]
fn test_next_steps_whole_line() {
    let mut session = started(&[MAIN]);
    let outcome = session.debugger.next(1).unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_eq!(outcome.pc, Some(MAIN + 0x8));
    assert_eq!(session.info.line.get(), Some(11));
    assert_eq!(session.sim.state().cpus[0].r[0], 2);
}

#[test]
fn test_step_into_function() {
    let mut session = started(&[MAIN]);
    session.debugger.next(1).unwrap();

    let outcome = session.debugger.step(1).unwrap();
    assert_eq!(outcome.pc, Some(INC));
    assert_eq!(session.info.line.get(), Some(20));

    let frames = session.debugger.backtrace().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].function.as_ref().unwrap().name, "inc");
    assert_eq!(frames[1].function.as_ref().unwrap().name, "main");
    assert_eq!(frames[1].pc, MAIN + 0xC);
}

#[test]
fn test_step_out_through_return() {
    let mut session = started(&[MAIN]);
    session.debugger.next(1).unwrap();
    session.debugger.step(1).unwrap();
    session.debugger.step(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), INC + 0x8);
    assert_eq!(session.info.line.get(), Some(22));

    let outcome = session.debugger.step(1).unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
    assert_eq!(session.info.line.get(), Some(12));
}

#[test]
fn test_next_over_call() {
    let mut session = started(&[MAIN]);
    session.debugger.next(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0xC);
    assert_eq!(session.info.line.get(), Some(12));
    assert_eq!(session.sim.state().cpus[0].r[0], 22);
    // step-resume breakpoint is gone and original code is in place
    assert!(session.debugger.breakpoints().is_empty());
    assert_eq!(
        session.debugger.read_memory(MAIN + 0xC, 1).unwrap(),
        vec![crate::common::sim::ADDI]
    );
}

#[test]
fn test_stepi_and_nexti() {
    let mut session = started(&[MAIN]);
    session.debugger.stepi(2).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0x8);

    session.debugger.nexti(1).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0xC);
    assert_reason!(session.info, StopReason::EndSteppingRange);

    assert!(matches!(
        session.debugger.stepi(0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_stepi_enters_call() {
    let mut session = started(&[MAIN]);
    session.debugger.stepi(3).unwrap();
    assert_eq!(session.debugger.pc().unwrap(), INC);
}

#[test]
fn test_finish_reports_return_value() {
    let mut session = started(&[MAIN]);
    session.debugger.next(1).unwrap();
    session.debugger.step(1).unwrap();

    let outcome = session.debugger.finish().unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
    let StopReason::FunctionFinished(Some(value)) = outcome.reason else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(value.ty.name, "int");
    assert_eq!(value.as_u64(), Some(22));
    assert!(session.debugger.breakpoints().is_empty());
}

#[test]
fn test_finish_in_outermost_frame() {
    let mut session = started(&[MAIN]);
    assert!(matches!(
        session.debugger.finish(),
        Err(Error::OutermostFrame)
    ));
    // nothing was resumed
    assert_eq!(session.sim.state().resumes, 0);
    assert_eq!(session.debugger.pc().unwrap(), MAIN);
}

#[test]
fn test_until_next_and_advance() {
    let mut session = started(&[MAIN]);
    let outcome = session.debugger.until_next().unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_eq!(outcome.pc, Some(MAIN + 0x8));

    let outcome = session.debugger.advance("inc").unwrap();
    assert_eq!(outcome.reason, StopReason::LocationReached);
    assert_eq!(outcome.pc, Some(INC));
}

#[test]
fn test_until_location_stops_at_caller_return() {
    let mut session = started(&[MAIN]);
    session.debugger.stepi(3).unwrap();

    // location is never reached, returning from inc stops the command
    let outcome = session.debugger.until("*0x1010").unwrap();
    assert_eq!(outcome.reason, StopReason::LocationReached);
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
}

#[test]
fn test_breakpoint_hit_then_exit() {
    let mut session = started(&[MAIN]);
    let number = session.debugger.set_breakpoint("*0x1004").unwrap();

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(vec![number]));
    assert_eq!(outcome.pc, Some(MAIN + 4));
    assert_eq!(session.info.line.get(), Some(10));
    assert_eq!(session.debugger.breakpoints()[0].hit_count, 1);
    // breakpoint instructions are removed while the program is stopped
    assert_eq!(session.sim.state().mem[0x1004], crate::common::sim::ADDI);

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
    assert_eq!(session.sim.state().read_u64(crate::common::RESULT_ADDR), Some(22));
}

#[test]
fn test_breakpoint_by_line_and_disable() {
    let mut session = started(&[MAIN]);
    let line_bp = session.debugger.set_breakpoint("main.c:12").unwrap();
    let fn_bp = session.debugger.set_breakpoint("inc").unwrap();
    session.debugger.enable_breakpoint(fn_bp, false).unwrap();

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(vec![line_bp]));
    assert_eq!(outcome.pc, Some(MAIN + 0xC));

    session.debugger.remove_breakpoint(line_bp).unwrap();
    assert!(session.debugger.remove_breakpoint(line_bp).is_err());
    assert!(session.debugger.set_breakpoint("nowhere").is_err());
}

#[test]
fn test_jump_skips_code() {
    let mut session = started(&[MAIN]);
    session.debugger.set_breakpoint("main.c:14").unwrap();
    session.debugger.jump("main.c:12").unwrap();
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0x14);
    assert_eq!(session.sim.state().cpus[0].r[0], 0);
    assert_eq!(session.sim.state().cpus[0].r[1], 5);
}

#[test]
fn test_register_access() {
    let mut session = started(&[MAIN]);
    session.debugger.write_register("r0", 100).unwrap();
    assert_eq!(
        session.debugger.read_register("r0").unwrap(),
        100u64.to_le_bytes().to_vec()
    );
    assert!(session.debugger.read_register("xmm0").is_err());

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(122));
}

#[test]
fn test_step_without_line_info_uses_function_bounds() {
    let mut session = started(&[SPIN]);
    session.debugger.set_breakpoint("*0x1300").unwrap();
    // spin has no line information: stepping ranges over the whole function and
    // the breakpoint at the loop head stops it
    let outcome = session.debugger.step(1).unwrap();
    assert!(matches!(outcome.reason, StopReason::BreakpointHit(_)));
    assert_eq!(outcome.pc, Some(SPIN));
}

#[test]
fn test_step_with_count() {
    let mut session = started(&[MAIN]);
    let stops = session.info.stops.get();

    let outcome = session.debugger.step(3).unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_eq!(outcome.pc, Some(INC + 0x4));
    assert_eq!(session.info.line.get(), Some(21));
    assert_eq!(session.sim.state().cpus[0].r[0], 12);
    // intermediate steps are not reported
    assert_eq!(session.info.stops.get(), stops + 1);
}

#[test]
fn test_finish_skips_tail_call_frame() {
    let mut session = started_with(
        |symbols| symbols.function("mid", MID, MID + 0x8),
        SimUnwinder {
            tail_calls: vec![(INC, MID + 0x4)],
        },
    );
    session.debugger.stepi(3).unwrap();

    let frames = session.debugger.backtrace().unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[1].kind, FrameKind::TailCall);
    assert_eq!(frames[1].function.as_ref().unwrap().name, "mid");
    assert_eq!(frames[2].function.as_ref().unwrap().name, "main");

    // the tail-call frame has no return address, finish returns to the real caller
    let outcome = session.debugger.finish().unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
    let StopReason::FunctionFinished(Some(value)) = outcome.reason else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(value.as_u64(), Some(22));
    assert!(session.debugger.breakpoints().is_empty());
}

#[test]
fn test_step_and_finish_inlined_call() {
    let mut session = started_with(
        |symbols| symbols.inline("add5", MAIN + 0xC, MAIN + 0x14, 12),
        SimUnwinder::default(),
    );
    session.debugger.next(1).unwrap();

    // returning from inc lands on the first instruction of the inlined call, next stops
    // there with the call not entered yet
    let outcome = session.debugger.next(1).unwrap();
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
    let frames = session.debugger.backtrace().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].function.as_ref().unwrap().name, "main");

    // entering the inlined call does not run the program
    let resumes = session.sim.state().resumes;
    let outcome = session.debugger.step(1).unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_eq!(outcome.pc, Some(MAIN + 0xC));
    assert_eq!(session.sim.state().resumes, resumes);
    let frames = session.debugger.backtrace().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind, FrameKind::Inline);
    assert_eq!(frames[0].function.as_ref().unwrap().name, "add5");

    // finish steps until the inlined code is left
    let outcome = session.debugger.finish().unwrap();
    assert_eq!(outcome.reason, StopReason::FunctionFinished(None));
    assert_eq!(outcome.pc, Some(MAIN + 0x14));
    assert_eq!(session.info.line.get(), Some(14));
    assert_eq!(session.sim.state().cpus[0].r[1], 5);
    assert_eq!(session.sim.state().read_u64(crate::common::RESULT_ADDR), Some(22));
    assert_eq!(session.debugger.backtrace().unwrap().len(), 1);
}

#[test]
fn test_exit_while_stepping() {
    // the guard breakpoint of a step sits in inc, a leftover guard would stop a later run there
    let mut session = started_with(|symbols| symbols.longjmp(INC), SimUnwinder::default());
    let number = session.debugger.set_breakpoint("main.c:12").unwrap();
    session.debugger.continue_execution().unwrap();

    let outcome = session.debugger.next(3).unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
    assert_eq!(session.info.exit_code.get(), Some(22));
    assert!(matches!(session.debugger.pc(), Err(_)));

    session.debugger.start().unwrap();
    session.debugger.remove_breakpoint(number).unwrap();
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
}

#[test]
fn test_resume_failure_while_stepping() {
    let mut session = started_with(|symbols| symbols.longjmp(INC), SimUnwinder::default());
    let number = session.debugger.set_breakpoint("main.c:12").unwrap();
    session.debugger.continue_execution().unwrap();

    // the first step of three runs, the second resume is refused
    let resumes = session.sim.state().resumes;
    session.sim.state_mut().fail_resume = Some(resumes + 2);
    assert!(session.debugger.next(3).is_err());
    assert_eq!(session.debugger.pc().unwrap(), MAIN + 0x10);
    assert_eq!(session.debugger.breakpoints().len(), 1);

    // the abandoned step left nothing behind: running through inc again does not stop
    // at the guard
    session.sim.state_mut().fail_resume = None;
    session.debugger.remove_breakpoint(number).unwrap();
    let outcome = session.debugger.jump("main.c:10").unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(44));
}
