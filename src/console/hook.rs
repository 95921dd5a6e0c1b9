use crate::debugger::ptid::Ptid;
use crate::debugger::{EventHook, StopOutcome, StopReason};

/// Prints debugger notifications to the terminal.
#[derive(Default)]
pub struct TerminalHook;

pub fn describe_stop(outcome: &StopOutcome) -> String {
    let place = match (&outcome.location, outcome.pc) {
        (Some(location), Some(pc)) => format!("{location} ({pc:#x})"),
        (None, Some(pc)) => format!("{pc:#x}"),
        _ => String::new(),
    };
    match &outcome.reason {
        StopReason::EndSteppingRange => place,
        StopReason::FunctionFinished(value) => match value.as_ref().and_then(|v| v.as_u64()) {
            Some(v) => format!("Run till exit, value returned: {v:#x}\n{place}"),
            None => format!("Run till exit\n{place}"),
        },
        StopReason::LocationReached => place,
        StopReason::BreakpointHit(numbers) => {
            let numbers: Vec<String> = numbers.iter().map(ToString::to_string).collect();
            format!("Breakpoint {}, {place}", numbers.join(", "))
        }
        StopReason::Signal(signal) => {
            format!("{} received signal {signal}, {place}", outcome.ptid)
        }
        StopReason::Interrupted => format!("{} interrupted, {place}", outcome.ptid),
        StopReason::Exited(code) => format!("Process {} exited with code {code}", outcome.ptid.pid),
        StopReason::Signalled(signal) => {
            format!("Process {} terminated with signal {signal}", outcome.ptid.pid)
        }
        StopReason::NoHistory => format!("No more reverse-execution history, {place}"),
    }
}

impl EventHook for TerminalHook {
    fn on_stop(&self, outcome: &StopOutcome) -> anyhow::Result<()> {
        println!("{}", describe_stop(outcome));
        Ok(())
    }

    fn on_exit(&self, pid: i32, code: i32) {
        println!("Process {pid} exited with code {code}");
    }

    fn on_new_thread(&self, ptid: Ptid) {
        println!("[New {ptid}]");
    }
}
