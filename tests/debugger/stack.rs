use crate::common::{sim_debugger, started, MAIN};
use strata::debugger::error::Error;
use strata::debugger::target::exec::ExecTarget;
use strata::debugger::target::{Stratum, TargetRef};

fn own_exec() -> TargetRef {
    let path = std::env::current_exe().unwrap();
    TargetRef::new(ExecTarget::open(&path).unwrap())
}

fn shortnames(debugger: &strata::debugger::Debugger) -> Vec<&'static str> {
    debugger
        .info_target_stack()
        .into_iter()
        .map(|l| l.shortname)
        .collect()
}

#[test]
fn test_layers_are_listed_top_first() {
    let mut session = sim_debugger(&[MAIN]);
    let stack = session.debugger.info_target_stack();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].stratum, Stratum::Dummy);

    let path = std::env::current_exe().unwrap();
    session.debugger.exec_file(&path).unwrap();
    session.debugger.start().unwrap();

    let stack = session.debugger.info_target_stack();
    let strata: Vec<_> = stack.iter().map(|l| l.stratum).collect();
    assert_eq!(strata, vec![Stratum::Process, Stratum::File, Stratum::Dummy]);
    assert_eq!(stack[0].shortname, "sim");
    assert_eq!(stack[1].shortname, "exec");
}

#[test]
fn test_exec_layer_serves_memory_without_process() {
    let mut session = sim_debugger(&[MAIN]);
    assert!(session.debugger.read_memory(0x1000, 4).is_err());

    let exec = ExecTarget::open(&std::env::current_exe().unwrap()).unwrap();
    let text = exec
        .sections()
        .iter()
        .find(|s| s.name == ".text")
        .cloned()
        .unwrap();
    session.debugger.push_target(TargetRef::new(exec)).unwrap();

    let mut expected = vec![0; 16];
    assert_eq!(text.read(0, &mut expected), 16);
    assert_eq!(
        session.debugger.read_memory(text.addr, 16).unwrap(),
        expected
    );
}

#[test]
fn test_process_layer_hides_exec_memory() {
    let mut session = sim_debugger(&[MAIN]);
    session.debugger.push_target(own_exec()).unwrap();
    session.debugger.start().unwrap();
    // the simulated machine covers the whole address space
    assert_eq!(
        session.debugger.read_memory(MAIN, 1).unwrap(),
        vec![crate::common::sim::ADDI]
    );
}

#[test]
fn test_push_replaces_layer_of_same_stratum() {
    let mut session = sim_debugger(&[MAIN]);
    let first = own_exec();
    let second = own_exec();

    session.debugger.push_target(first.clone()).unwrap();
    assert_eq!(first.refcount(), 1);
    // pushing the same layer again changes nothing
    session.debugger.push_target(first.clone()).unwrap();
    assert_eq!(first.refcount(), 1);

    session.debugger.push_target(second.clone()).unwrap();
    assert!(first.is_closed());
    assert_eq!(second.refcount(), 1);
    assert_eq!(shortnames(&session.debugger), vec!["exec", "None"]);

    assert!(session.debugger.unpush_target(Stratum::File).unwrap());
    assert!(second.is_closed());
    assert!(!session.debugger.unpush_target(Stratum::File).unwrap());
    // closed layers can not come back
    assert!(session.debugger.push_target(second).is_err());
}

#[test]
fn test_process_exit_unpushes_process_layer() {
    let mut session = sim_debugger(&[MAIN]);
    session.debugger.push_target(own_exec()).unwrap();
    session.debugger.run().unwrap();
    let strata: Vec<_> = session
        .debugger
        .info_target_stack()
        .into_iter()
        .map(|l| l.stratum)
        .collect();
    assert_eq!(strata, vec![Stratum::File, Stratum::Dummy]);
}

#[test]
fn test_inferiors_share_exec_layer() {
    let mut session = sim_debugger(&[MAIN]);
    let exec = own_exec();
    session.debugger.push_target(exec.clone()).unwrap();

    let num = session.debugger.add_inferior(true).unwrap();
    assert_eq!(num, 2);
    assert_eq!(exec.refcount(), 2);
    let bare = session.debugger.add_inferior(false).unwrap();
    assert_eq!(bare, 3);
    assert_eq!(exec.refcount(), 2);
    assert_eq!(session.debugger.inferiors().count(), 3);

    session.debugger.switch_inferior(num).unwrap();
    assert_eq!(session.debugger.current_inferior().num(), 2);
    assert_eq!(
        session.debugger.current_inferior().program(),
        Some(std::path::Path::new("sim-program"))
    );
    assert!(session
        .debugger
        .current_inferior()
        .stack()
        .find(Stratum::File)
        .unwrap()
        .ptr_eq(&exec));

    assert!(matches!(
        session.debugger.remove_inferior(2),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        session.debugger.switch_inferior(9),
        Err(Error::InferiorNotFound(9))
    ));

    session.debugger.switch_inferior(1).unwrap();
    session.debugger.remove_inferior(2).unwrap();
    assert_eq!(exec.refcount(), 1);
    assert!(!exec.is_closed());
}

#[test]
fn test_inferior_with_process_is_kept() {
    let mut session = started(&[MAIN]);
    let num = session.debugger.add_inferior(false).unwrap();
    session.debugger.switch_inferior(num).unwrap();
    assert!(matches!(
        session.debugger.remove_inferior(1),
        Err(Error::AlreadyRunning)
    ));
    // a fresh inferior has no process
    assert!(session.debugger.pc().is_err());
}
