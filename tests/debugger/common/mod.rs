pub mod sim;

use crate::common::sim::{insn, Sim, SimArch, SimUnwinder, ADDI, CALL, HALT, JMP, RAISE, RET, STORE};
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use strata::debugger::arch::{ReturnType, ValueClass};
use strata::debugger::ptid::Ptid;
use strata::debugger::symbols::{
    FunctionBounds, InlineBlock, LineRange, LineResolver, Linespec, SourceLocation,
};
use strata::debugger::target::TargetRef;
use strata::debugger::{CoreAddr, Debugger, DebuggerBuilder, EventHook, StopOutcome, StopReason};

pub const MAIN: u64 = 0x1000;
pub const INC: u64 = 0x1100;
pub const RAISER: u64 = 0x1200;
pub const SPIN: u64 = 0x1300;
pub const RESULT_ADDR: u64 = 0x8000;

#[derive(Clone, Default)]
pub struct TestInfo {
    pub pc: Arc<Cell<Option<u64>>>,
    pub line: Arc<Cell<Option<u64>>>,
    pub reason: Arc<RefCell<Option<StopReason>>>,
    pub stops: Arc<Cell<u32>>,
    pub exit_code: Arc<Cell<Option<i32>>>,
    pub signals: Arc<RefCell<Vec<(Ptid, Signal)>>>,
    pub new_threads: Arc<RefCell<Vec<Ptid>>>,
}

#[derive(Default)]
pub struct TestHooks {
    info: TestInfo,
}

impl TestHooks {
    pub fn new(info: TestInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_stop(&self, outcome: &StopOutcome) -> anyhow::Result<()> {
        self.info.pc.set(outcome.pc);
        self.info.line.set(outcome.location.as_ref().map(|l| l.line));
        self.info.reason.replace(Some(outcome.reason.clone()));
        self.info.stops.set(self.info.stops.get() + 1);
        Ok(())
    }

    fn on_signal(&self, ptid: Ptid, signal: Signal) {
        self.info.signals.borrow_mut().push((ptid, signal));
    }

    fn on_exit(&self, _: i32, code: i32) {
        self.info.exit_code.set(Some(code));
    }

    fn on_new_thread(&self, ptid: Ptid) {
        self.info.new_threads.borrow_mut().push(ptid);
    }
}

/// Symbol tables written by hand.
#[derive(Clone, Default)]
pub struct MockSymbols {
    functions: Vec<FunctionBounds>,
    lines: Vec<LineRange>,
    inlines: Vec<InlineBlock>,
    return_types: HashMap<String, ReturnType>,
    longjmp: Option<CoreAddr>,
}

impl MockSymbols {
    pub fn function(mut self, name: &str, low: CoreAddr, high: CoreAddr) -> Self {
        self.functions.push(FunctionBounds {
            name: name.to_string(),
            low,
            high,
        });
        self
    }

    pub fn line(mut self, file: &str, line: u64, start: CoreAddr, end: CoreAddr) -> Self {
        self.lines.push(LineRange {
            file: file.to_string(),
            line,
            start,
            end,
        });
        self
    }

    /// Inlined call of `name` made from `call_line` of main.c.
    pub fn inline(mut self, name: &str, low: CoreAddr, high: CoreAddr, call_line: u64) -> Self {
        self.inlines.push(InlineBlock {
            name: name.to_string(),
            low,
            high,
            call_site: Some(SourceLocation {
                file: "main.c".to_string(),
                line: call_line,
            }),
        });
        self
    }

    pub fn returns(mut self, function: &str, ty: ReturnType) -> Self {
        self.return_types.insert(function.to_string(), ty);
        self
    }

    pub fn longjmp(mut self, target: CoreAddr) -> Self {
        self.longjmp = Some(target);
        self
    }
}

impl LineResolver for MockSymbols {
    fn function_at(&self, pc: CoreAddr) -> Option<FunctionBounds> {
        self.functions.iter().find(|f| f.contains(pc)).cloned()
    }

    fn line_at(&self, pc: CoreAddr) -> Option<LineRange> {
        self.lines
            .iter()
            .find(|l| pc >= l.start && pc < l.end)
            .cloned()
    }

    fn resolve(&self, spec: &Linespec) -> Option<CoreAddr> {
        match spec {
            Linespec::Address(addr) => Some(*addr),
            Linespec::Function(name) => self
                .functions
                .iter()
                .find(|f| &f.name == name)
                .map(|f| f.low),
            Linespec::Line { file, line } => self
                .lines
                .iter()
                .find(|l| &l.file == file && l.line == *line)
                .map(|l| l.start),
        }
    }

    fn inline_block_at(&self, pc: CoreAddr) -> Option<InlineBlock> {
        self.inlines
            .iter()
            .filter(|b| pc >= b.low && pc < b.high)
            .min_by_key(|b| b.high - b.low)
            .cloned()
    }

    fn return_type(&self, function: &FunctionBounds) -> Option<ReturnType> {
        self.return_types.get(&function.name).cloned()
    }

    fn longjmp_target(&self) -> Option<CoreAddr> {
        self.longjmp
    }
}

/// Load the test program:
///
/// ```text
/// main.c
/// 10    r0 += 1; r0 += 1;
/// 11    inc();
/// 12    r1 += 5;
/// 13    *RESULT_ADDR = r0;
/// 14    exit(r0);
///
/// 20    r0 += 10;       (inc)
/// 21    r0 += 10;
/// 22    return r0;
/// ```
///
/// `raiser` raises SIGUSR1 and exits, `spin` loops forever, both have no line information.
pub fn load_program(sim: &Sim) -> MockSymbols {
    sim.load(
        MAIN,
        &[
            insn(ADDI, 0, 1),
            insn(ADDI, 0, 1),
            insn(CALL, 0, INC as u16),
            insn(ADDI, 1, 5),
            insn(STORE, 0, RESULT_ADDR as u16),
            insn(HALT, 0, 0),
        ],
    );
    sim.load(INC, &[insn(ADDI, 0, 10), insn(ADDI, 0, 10), insn(RET, 0, 0)]);
    sim.load(
        RAISER,
        &[insn(RAISE, 0, Signal::SIGUSR1 as u16), insn(HALT, 0, 0)],
    );
    sim.load(SPIN, &[insn(JMP, 0, SPIN as u16)]);

    MockSymbols::default()
        .function("main", MAIN, MAIN + 0x18)
        .function("inc", INC, INC + 0xC)
        .function("raiser", RAISER, RAISER + 0x8)
        .function("spin", SPIN, SPIN + 0x4)
        .line("main.c", 10, MAIN, MAIN + 0x8)
        .line("main.c", 11, MAIN + 0x8, MAIN + 0xC)
        .line("main.c", 12, MAIN + 0xC, MAIN + 0x10)
        .line("main.c", 13, MAIN + 0x10, MAIN + 0x14)
        .line("main.c", 14, MAIN + 0x14, MAIN + 0x18)
        .line("main.c", 20, INC, INC + 0x4)
        .line("main.c", 21, INC + 0x4, INC + 0x8)
        .line("main.c", 22, INC + 0x8, INC + 0xC)
        .returns(
            "inc",
            ReturnType {
                name: "int".to_string(),
                size: 4,
                class: ValueClass::Integer,
            },
        )
}

pub struct SimSession {
    pub debugger: Debugger,
    pub sim: Sim,
    pub info: TestInfo,
}

/// Debugger over a simulated machine with a cpu per entry address, the process is not created.
pub fn sim_debugger(entries: &[u64]) -> SimSession {
    sim_debugger_with(entries, |symbols| symbols, SimUnwinder::default())
}

/// Same as [`sim_debugger`] with extra symbols on top of the test program and a custom unwinder.
pub fn sim_debugger_with(
    entries: &[u64],
    extend: impl FnOnce(MockSymbols) -> MockSymbols,
    unwinder: SimUnwinder,
) -> SimSession {
    let sim = Sim::new(entries);
    let symbols = extend(load_program(&sim));
    let info = TestInfo::default();
    let factory_sim = sim.clone();
    let mut debugger = DebuggerBuilder::new()
        .with_arch(SimArch)
        .with_unwinder(unwinder)
        .with_symbols(symbols)
        .with_hooks(TestHooks::new(info.clone()))
        .with_run_target(move || Ok(TargetRef::new(factory_sim.target())))
        .build()
        .unwrap();
    debugger.set_program("sim-program", vec![]);
    SimSession {
        debugger,
        sim,
        info,
    }
}

/// Same as [`sim_debugger`], with the process created and stopped at its first instruction.
pub fn started(entries: &[u64]) -> SimSession {
    let mut session = sim_debugger(entries);
    session.debugger.start().unwrap();
    session
}

#[macro_export]
macro_rules! assert_reason {
    ($info: expr, $reason: pat) => {
        let reason = $info.reason.borrow().clone();
        assert!(
            matches!(reason, Some($reason)),
            "unexpected stop reason: {reason:?}"
        );
    };
}
