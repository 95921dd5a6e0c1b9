//! Per-signal handling policy.

use nix::sys::signal::Signal;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalPolicy {
    /// Report the signal to the user and stop.
    pub stop: bool,
    /// Deliver the signal to the program when it resumes.
    pub pass: bool,
}

/// Signal pass table: what to do when an execution unit receives a signal.
pub struct SignalTable {
    policies: HashMap<Signal, SignalPolicy>,
}

impl Default for SignalTable {
    fn default() -> Self {
        let mut policies: HashMap<Signal, SignalPolicy> = Signal::iterator()
            .map(|s| (s, SignalPolicy { stop: true, pass: true }))
            .collect();
        let quiet = SignalPolicy {
            stop: false,
            pass: true,
        };
        for signal in [
            Signal::SIGALRM,
            Signal::SIGURG,
            Signal::SIGCHLD,
            Signal::SIGWINCH,
            Signal::SIGPROF,
            Signal::SIGIO,
            Signal::SIGVTALRM,
        ] {
            policies.insert(signal, quiet);
        }
        // debugger owned signals
        for signal in [Signal::SIGTRAP, Signal::SIGINT] {
            policies.insert(
                signal,
                SignalPolicy {
                    stop: true,
                    pass: false,
                },
            );
        }
        Self { policies }
    }
}

impl SignalTable {
    pub fn policy(&self, signal: Signal) -> SignalPolicy {
        self.policies
            .get(&signal)
            .copied()
            .unwrap_or(SignalPolicy {
                stop: true,
                pass: true,
            })
    }

    pub fn set(&mut self, signal: Signal, policy: SignalPolicy) {
        self.policies.insert(signal, policy);
    }
}
