//! Real processes under ptrace.

#![cfg(all(target_os = "linux", feature = "int_test"))]

use crate::common::{TestHooks, TestInfo};
use serial_test::serial;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use strata::debugger::{Debugger, DebuggerBuilder, StopReason};

const MT_APP: &str = env!("CARGO_BIN_EXE_mt");
const SLEEPER_APP: &str = env!("CARGO_BIN_EXE_sleeper");

fn native_debugger(program: &str, args: &[&str]) -> (Debugger, TestInfo) {
    let info = TestInfo::default();
    let mut debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .build()
        .unwrap();
    debugger.exec_file(Path::new(program)).unwrap();
    debugger.set_program(program, args.iter().map(|a| a.to_string()).collect());
    (debugger, info)
}

#[test]
#[serial]
fn test_native_run_to_exit() {
    let (mut debugger, info) = native_debugger(MT_APP, &[]);
    let ptid = debugger.start().unwrap();
    assert!(debugger.pc().unwrap() != 0);
    assert_eq!(debugger.info_target_stack()[0].shortname, "native");
    assert_eq!(ptid.pid, ptid.lwp as i32);

    let outcome = debugger.continue_execution().unwrap();
    assert_eq!(outcome.reason, StopReason::Exited(3));
    assert_eq!(info.exit_code.get(), Some(3));
    assert_eq!(debugger.current_inferior().pid(), None);
}

#[test]
#[serial]
fn test_native_memory_and_registers() {
    let (mut debugger, _) = native_debugger(MT_APP, &[]);
    debugger.start().unwrap();
    let pc = debugger.pc().unwrap();
    assert_eq!(
        debugger.read_register("rip").unwrap(),
        pc.to_le_bytes().to_vec()
    );

    // stack memory is writable
    let sp = u64::from_le_bytes(
        debugger.read_register("rsp").unwrap()[..8]
            .try_into()
            .unwrap(),
    );
    let original = debugger.read_memory(sp, 8).unwrap();
    debugger.write_memory(sp, &[0xAB; 8]).unwrap();
    assert_eq!(debugger.read_memory(sp, 8).unwrap(), vec![0xAB; 8]);
    debugger.write_memory(sp, &original).unwrap();

    let outcome = debugger.stepi(1).unwrap();
    assert_eq!(outcome.reason, StopReason::EndSteppingRange);
    assert_ne!(debugger.pc().unwrap(), pc);
    debugger.kill().unwrap();
}

#[test]
#[serial]
fn test_native_interrupt() {
    let (mut debugger, _) = native_debugger(SLEEPER_APP, &["-s", "1"]);
    debugger.start().unwrap();

    let token = debugger.interrupt_token();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        token.mark();
    });
    let outcome = debugger.continue_execution().unwrap();
    interrupter.join().unwrap();
    assert_eq!(outcome.reason, StopReason::Interrupted);

    let threads = debugger.info_threads().unwrap();
    assert!(!threads.is_empty());
    assert!(threads.iter().all(|t| t.target_id.starts_with("Thread ")));
    debugger.kill().unwrap();
}

#[test]
#[serial]
fn test_native_attach_and_detach() {
    let mut child = Command::new(SLEEPER_APP)
        .args(["-s", "1"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    let (mut debugger, _) = native_debugger(SLEEPER_APP, &[]);
    let ptid = debugger.attach(child.id() as i32).unwrap();
    assert_eq!(ptid.pid, child.id() as i32);
    assert!(debugger.info_threads().unwrap().len() >= 1);

    debugger.detach().unwrap();
    assert_eq!(debugger.current_inferior().pid(), None);
    // the process keeps running without the debugger
    assert!(child.try_wait().unwrap().is_none());

    child.kill().unwrap();
    child.wait().unwrap();
}
