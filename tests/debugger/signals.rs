use crate::assert_reason;
use crate::common::sim::cpu_ptid;
use crate::common::{started, MAIN, RAISER, SPIN};
use nix::sys::signal::Signal;
use strata::debugger::error::Error;
use strata::debugger::signals::SignalPolicy;
use strata::debugger::StopReason;

#[test]
fn test_signal_stops_and_is_passed() {
    let mut session = started(&[RAISER]);
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Signal(Signal::SIGUSR1));
    assert_eq!(outcome.ptid, cpu_ptid(0));
    assert_eq!(
        *session.info.signals.borrow(),
        vec![(cpu_ptid(0), Signal::SIGUSR1)]
    );
    assert!(session.sim.state().delivered.is_empty());

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(0));
    assert_eq!(
        session.sim.state().delivered,
        vec![(cpu_ptid(0), Signal::SIGUSR1)]
    );
}

#[test]
fn test_nostop_signal_is_delivered_silently() {
    let mut session = started(&[RAISER]);
    session.debugger.handle_signal(
        Signal::SIGUSR1,
        SignalPolicy {
            stop: false,
            pass: true,
        },
    );
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(0));
    assert!(session.info.signals.borrow().is_empty());
    assert_eq!(
        session.sim.state().delivered,
        vec![(cpu_ptid(0), Signal::SIGUSR1)]
    );
}

#[test]
fn test_nopass_signal_is_discarded() {
    let mut session = started(&[RAISER]);
    session.debugger.handle_signal(
        Signal::SIGUSR1,
        SignalPolicy {
            stop: true,
            pass: false,
        },
    );
    session.debugger.continue_execution().unwrap();
    assert_reason!(session.info, StopReason::Signal(Signal::SIGUSR1));

    session.debugger.continue_execution().unwrap();
    assert_reason!(session.info, StopReason::Exited(0));
    assert!(session.sim.state().delivered.is_empty());
}

#[test]
fn test_default_policies() {
    let session = started(&[MAIN]);
    let policy = |s| session.debugger.signal_policy(s);
    assert_eq!(
        policy(Signal::SIGSEGV),
        SignalPolicy {
            stop: true,
            pass: true
        }
    );
    assert_eq!(
        policy(Signal::SIGCHLD),
        SignalPolicy {
            stop: false,
            pass: true
        }
    );
    assert_eq!(
        policy(Signal::SIGTRAP),
        SignalPolicy {
            stop: true,
            pass: false
        }
    );
    assert!(!policy(Signal::SIGINT).pass);
}

#[test]
fn test_signal_zero_cancels_delivery() {
    let mut session = started(&[RAISER]);
    session.debugger.continue_execution().unwrap();
    assert_reason!(session.info, StopReason::Signal(Signal::SIGUSR1));

    let outcome = session.debugger.signal(None).unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(0));
    assert!(session.sim.state().delivered.is_empty());
}

#[test]
fn test_signal_command_replaces_pending_signal() {
    let mut session = started(&[RAISER]);
    session.debugger.continue_execution().unwrap();

    session.debugger.signal(Some(Signal::SIGUSR2)).unwrap();
    assert_eq!(
        session.sim.state().delivered,
        vec![(cpu_ptid(0), Signal::SIGUSR2)]
    );
}

#[test]
fn test_queue_signal() {
    let mut session = started(&[MAIN]);
    session.debugger.queue_signal(Signal::SIGUSR2).unwrap();
    assert!(matches!(
        session.debugger.queue_signal(Signal::SIGINT),
        Err(Error::InvalidArgument(_))
    ));

    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(22));
    assert_eq!(
        session.sim.state().delivered,
        vec![(cpu_ptid(0), Signal::SIGUSR2)]
    );
}

#[test]
fn test_pending_signals_elsewhere() {
    let mut session = started(&[RAISER, SPIN]);
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Signal(Signal::SIGUSR1));
    assert_eq!(outcome.ptid, cpu_ptid(0));

    // the unit that got the signal has no pending signal elsewhere
    assert!(session
        .debugger
        .pending_signals_elsewhere()
        .unwrap()
        .is_empty());

    assert_eq!(session.debugger.select_thread(2).unwrap(), cpu_ptid(1));
    assert_eq!(
        session.debugger.pending_signals_elsewhere().unwrap(),
        vec![(cpu_ptid(0), Signal::SIGUSR1)]
    );

    // signals that are not passed are not reported
    session.debugger.handle_signal(
        Signal::SIGUSR1,
        SignalPolicy {
            stop: true,
            pass: false,
        },
    );
    assert!(session
        .debugger
        .pending_signals_elsewhere()
        .unwrap()
        .is_empty());
}

#[test]
fn test_interrupt_running_program() {
    let mut session = started(&[SPIN]);
    session.debugger.interrupt_token().mark();
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Interrupted);
    assert_eq!(outcome.pc, Some(SPIN));
    // the stop signal is not delivered to the program
    assert!(session.sim.state().delivered.is_empty());
    assert!(session.info.signals.borrow().is_empty());
}

#[test]
fn test_interrupt_stops_every_unit() {
    let mut session = started(&[SPIN, SPIN]);
    session.debugger.interrupt_token().mark();
    let outcome = session.debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Interrupted);

    let threads = session.debugger.info_threads().unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads
        .iter()
        .all(|t| t.state == strata::debugger::thread::ThreadState::Stopped));

    // nothing is left pending, the program runs again
    assert!(!session.debugger.interrupt_token().is_ready());
}

#[test]
fn test_interrupt_without_running_program() {
    let mut session = started(&[MAIN]);
    session.debugger.interrupt().unwrap();
    assert_eq!(session.sim.state().resumes, 0);
}
