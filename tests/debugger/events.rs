use crate::common::{started, MAIN};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;
use strata::debugger::signals::SignalPolicy;
use strata::debugger::Debugger;

#[test]
fn test_async_event_handler_runs_with_debugger() {
    let mut session = started(&[MAIN]);
    let event_loop = session.debugger.event_loop();
    let id = event_loop.create_async_event_handler("set-breakpoint", |dbg: &mut Debugger| {
        dbg.set_breakpoint("*0x1004").unwrap();
    });

    assert!(!session.debugger.process_events(false).unwrap());
    event_loop.mark_async_event_handler(id);
    assert!(event_loop.async_event_handler_ready(id));
    assert!(session.debugger.process_events(false).unwrap());
    assert_eq!(session.debugger.breakpoints().len(), 1);

    // handler is cleared after it runs
    assert!(!session.debugger.process_events(false).unwrap());
    assert_eq!(session.debugger.breakpoints().len(), 1);
    assert!(event_loop.delete_async_event_handler(id));
}

#[test]
fn test_timer_fires_once() {
    let mut session = started(&[MAIN]);
    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    session
        .debugger
        .event_loop()
        .create_timer(Duration::ZERO, move |dbg: &mut Debugger| {
            counter.set(counter.get() + 1);
            dbg.handle_signal(
                Signal::SIGUSR1,
                SignalPolicy {
                    stop: false,
                    pass: false,
                },
            );
        });

    assert!(session.debugger.process_events(false).unwrap());
    assert!(!session.debugger.process_events(false).unwrap());
    assert_eq!(fired.get(), 1);
    assert!(!session.debugger.signal_policy(Signal::SIGUSR1).stop);
}

#[test]
fn test_blocking_pass_waits_for_timer() {
    let mut session = started(&[MAIN]);
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    session
        .debugger
        .event_loop()
        .create_timer(Duration::from_millis(30), move |_: &mut Debugger| {
            flag.set(true)
        });

    assert!(!session.debugger.process_events(false).unwrap());
    assert!(session.debugger.process_events(true).unwrap());
    assert!(fired.get());
}

#[test]
fn test_file_handler() {
    let mut session = started(&[MAIN]);
    let (reader, mut writer) = os_pipe::pipe().unwrap();
    let ready = Rc::new(Cell::new(false));
    let flag = ready.clone();
    let id = session
        .debugger
        .event_loop()
        .add_file_handler(&reader, move |_: &mut Debugger| flag.set(true))
        .unwrap();

    assert!(!session.debugger.process_events(false).unwrap());
    assert!(!ready.get());

    writer.write_all(b"x").unwrap();
    assert!(session.debugger.process_events(false).unwrap());
    assert!(ready.get());
    assert!(session.debugger.event_loop().delete_file_handler(id));
}

#[test]
fn test_async_signal_handler_switches_to_primary_ui() {
    let mut session = started(&[MAIN]);
    let second = session
        .debugger
        .add_ui(crate::common::TestHooks::new(Default::default()));
    session.debugger.switch_ui(second).unwrap();
    assert_eq!(session.debugger.current_ui(), second);
    assert_eq!(session.debugger.primary_ui(), 0);

    // nothing runs, the interrupt only changes the current ui
    session.debugger.interrupt_token().mark();
    assert!(session.debugger.process_events(false).unwrap());
    assert_eq!(session.debugger.current_ui(), 0);
    assert!(!session.debugger.interrupt_token().is_ready());
    assert_eq!(session.sim.state().resumes, 0);

    session.debugger.set_primary_ui(second).unwrap();
    session.debugger.switch_ui(0).unwrap();
    session.debugger.interrupt_token().mark();
    session.debugger.process_events(false).unwrap();
    assert_eq!(session.debugger.current_ui(), second);
    assert!(session.debugger.set_primary_ui(7).is_err());
}

#[test]
fn test_event_handler_can_resume_program() {
    let mut session = started(&[MAIN]);
    let outcome = Rc::new(Cell::new(None));
    let slot = outcome.clone();
    let event_loop = session.debugger.event_loop();
    let id = event_loop.create_async_event_handler("continue", move |dbg: &mut Debugger| {
        let res = dbg.continue_execution().unwrap();
        slot.set(Some(res.reason == strata::debugger::StopReason::Exited(22)));
    });
    event_loop.mark_async_event_handler(id);
    session.debugger.process_events(false).unwrap();
    assert_eq!(outcome.get(), Some(true));
}
