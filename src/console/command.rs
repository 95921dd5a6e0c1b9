//! Console command line parser.

use crate::debugger::memory::MemAccess;
use crate::debugger::symbols::{address, linespec, number, ParseErr};
use crate::debugger::CoreAddr;
use chumsky::error::Rich;
use chumsky::prelude::{any, choice, end, just};
use chumsky::{text, Boxed, IterParser, Parser};
use itertools::Itertools;
use nix::sys::signal::Signal;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Parsing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAction {
    Stop,
    NoStop,
    Pass,
    NoPass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    File(String),
    Run,
    Start,
    Attach(i32),
    Detach,
    Kill,
    Continue,
    Step(u32),
    Next(u32),
    StepI(u32),
    NextI(u32),
    Until(Option<String>),
    Advance(String),
    Finish,
    Jump(String),
    Signal(Option<Signal>),
    QueueSignal(Signal),
    Handle(Signal, Vec<SignalAction>),
    Interrupt,
    ReverseStep(u32),
    ReverseNext(u32),
    ReverseStepI(u32),
    ReverseNextI(u32),
    ReverseContinue,
    ReverseFinish,
    Record,
    RecordStop,
    Bookmark,
    DeleteBookmark(Option<u32>),
    GotoBookmark(String),
    Bookmarks,
    Break(String),
    Delete(u32),
    Enable(u32),
    Disable(u32),
    Breakpoints,
    Threads,
    Thread(u32),
    Backtrace,
    Registers(String),
    SetRegister(String, u64),
    ExamineMemory(CoreAddr, usize),
    WriteMemory(CoreAddr, Vec<u8>),
    MemRegion(CoreAddr, CoreAddr, MemAccess),
    DeleteMemRegion(Option<u32>),
    EnableMemRegion(u32),
    DisableMemRegion(u32),
    MemRegions,
    OverlayMap(String),
    OverlayUnmap(String),
    TargetStack,
    Inferiors,
    AddInferior,
    Inferior(u32),
    RemoveInferior(u32),
}

/// Command word, must be followed by a blank or the end of input.
fn keyword<'a>(word: &'static str) -> impl Parser<'a, &'a str, (), ParseErr<'a>> {
    just(word)
        .then_ignore(text::whitespace().at_least(1).or(end()))
        .padded()
        .ignored()
}

fn word<'a>() -> impl Parser<'a, &'a str, String, ParseErr<'a>> {
    any()
        .filter(|c: &char| !c.is_whitespace())
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
        .padded()
}

fn location<'a>() -> impl Parser<'a, &'a str, String, ParseErr<'a>> {
    linespec()
        .to_slice()
        .map(|s: &str| s.trim().to_string())
}

pub fn signal<'a>() -> impl Parser<'a, &'a str, Signal, ParseErr<'a>> {
    text::ascii::ident()
        .try_map(|name: &str, span| {
            let name = name.to_uppercase();
            let name = if name.starts_with("SIG") {
                name
            } else {
                format!("SIG{name}")
            };
            Signal::from_str(&name).map_err(|_| Rich::custom(span, format!("unknown signal {name}")))
        })
        .padded()
        .labelled("signal")
}

/// Hex digits taken by pairs, an optional `0x` prefix is allowed.
pub fn bytes<'a>() -> impl Parser<'a, &'a str, Vec<u8>, ParseErr<'a>> {
    let digit = any().filter(|c: &char| c.is_ascii_hexdigit());
    let byte = digit
        .clone()
        .then(digit)
        .to_slice()
        .try_map(|s: &str, span| u8::from_str_radix(s, 16).map_err(|e| Rich::custom(span, e)));
    just("0x")
        .or_not()
        .ignore_then(byte.repeated().at_least(1).collect::<Vec<_>>())
        .padded()
        .labelled("hex bytes")
}

fn mem_access<'a>() -> impl Parser<'a, &'a str, MemAccess, ParseErr<'a>> {
    text::ascii::ident()
        .try_map(|s: &str, span| {
            MemAccess::from_str(s).map_err(|_| Rich::custom(span, format!("unknown access mode {s}")))
        })
        .padded()
        .labelled("access mode")
}

fn command<'a, I>(ctx: &'static str, inner: I) -> Boxed<'a, 'a, &'a str, Command, ParseErr<'a>>
where
    I: Parser<'a, &'a str, Command, ParseErr<'a>> + 'a,
{
    inner.then_ignore(end()).labelled(ctx).boxed()
}

impl Command {
    /// Parse input string into command.
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        Self::parser()
            .parse(input)
            .into_result()
            .map_err(|errors| CommandError::Parsing(errors.iter().map(ToString::to_string).join("\n")))
    }

    fn parser<'a>() -> impl Parser<'a, &'a str, Command, ParseErr<'a>> {
        let op = keyword;
        let op2 = |full: &'static str, short: &'static str| keyword(full).or(keyword(short));
        let count = || number::<u32>().or_not().map(|n| n.unwrap_or(1));

        let session = choice((
            command("help", op2("help", "h").to(Command::Help)),
            command("quit", op2("quit", "q").to(Command::Quit)),
            command("file", op("file").ignore_then(word()).map(Command::File)),
            command("run", op2("run", "r").to(Command::Run)),
            command("start", op("start").to(Command::Start)),
            command(
                "attach",
                op("attach").ignore_then(number::<i32>()).map(Command::Attach),
            ),
            command("detach", op("detach").to(Command::Detach)),
            command("kill", op2("kill", "k").to(Command::Kill)),
            command("target-stack", op("target-stack").to(Command::TargetStack)),
            command("inferiors", op("inferiors").to(Command::Inferiors)),
            command("add-inferior", op("add-inferior").to(Command::AddInferior)),
            command(
                "inferior",
                op("inferior").ignore_then(number()).map(Command::Inferior),
            ),
            command(
                "remove-inferior",
                op("remove-inferior")
                    .ignore_then(number())
                    .map(Command::RemoveInferior),
            ),
        ));

        let execution = choice((
            command("continue", op2("continue", "c").to(Command::Continue)),
            command("step", op2("step", "s").ignore_then(count()).map(Command::Step)),
            command("next", op2("next", "n").ignore_then(count()).map(Command::Next)),
            command("stepi", op2("stepi", "si").ignore_then(count()).map(Command::StepI)),
            command("nexti", op2("nexti", "ni").ignore_then(count()).map(Command::NextI)),
            command(
                "until",
                op2("until", "u")
                    .ignore_then(location().or_not())
                    .map(Command::Until),
            ),
            command(
                "advance",
                op("advance").ignore_then(location()).map(Command::Advance),
            ),
            command("finish", op2("finish", "fin").to(Command::Finish)),
            command("jump", op("jump").ignore_then(location()).map(Command::Jump)),
            command("interrupt", op("interrupt").to(Command::Interrupt)),
        ));

        let signals = {
            let action = choice((
                op("stop").to(SignalAction::Stop),
                op("nostop").to(SignalAction::NoStop),
                op("pass").to(SignalAction::Pass),
                op("nopass").to(SignalAction::NoPass),
            ));
            choice((
                command(
                    "signal",
                    op("signal")
                        .ignore_then(
                            choice((just('0').padded().to(None), signal().map(Some))).or_not(),
                        )
                        .map(|signal| Command::Signal(signal.flatten())),
                ),
                command(
                    "queue-signal",
                    op("queue-signal")
                        .ignore_then(signal())
                        .map(Command::QueueSignal),
                ),
                command(
                    "handle",
                    op("handle")
                        .ignore_then(signal())
                        .then(action.repeated().collect::<Vec<_>>())
                        .map(|(signal, actions)| Command::Handle(signal, actions)),
                ),
            ))
        };

        let reverse = choice((
            command(
                "reverse-step",
                op2("reverse-step", "rs")
                    .ignore_then(count())
                    .map(Command::ReverseStep),
            ),
            command(
                "reverse-next",
                op2("reverse-next", "rn")
                    .ignore_then(count())
                    .map(Command::ReverseNext),
            ),
            command(
                "reverse-stepi",
                op2("reverse-stepi", "rsi")
                    .ignore_then(count())
                    .map(Command::ReverseStepI),
            ),
            command(
                "reverse-nexti",
                op2("reverse-nexti", "rni")
                    .ignore_then(count())
                    .map(Command::ReverseNextI),
            ),
            command(
                "reverse-continue",
                op2("reverse-continue", "rc").to(Command::ReverseContinue),
            ),
            command("reverse-finish", op("reverse-finish").to(Command::ReverseFinish)),
            command(
                "record",
                op("record")
                    .ignore_then(op("stop").or_not())
                    .map(|stop| match stop {
                        Some(_) => Command::RecordStop,
                        None => Command::Record,
                    }),
            ),
            command("bookmark", op("bookmark").to(Command::Bookmark)),
            command("bookmarks", op("bookmarks").to(Command::Bookmarks)),
            command(
                "delete-bookmark",
                op("delete-bookmark")
                    .ignore_then(number().or_not())
                    .map(Command::DeleteBookmark),
            ),
            command(
                "goto-bookmark",
                op("goto-bookmark")
                    .ignore_then(word())
                    .map(Command::GotoBookmark),
            ),
        ));

        let breakpoints = choice((
            command("break", op2("break", "b").ignore_then(location()).map(Command::Break)),
            command("delete", op2("delete", "d").ignore_then(number()).map(Command::Delete)),
            command("enable", op("enable").ignore_then(number()).map(Command::Enable)),
            command("disable", op("disable").ignore_then(number()).map(Command::Disable)),
            command("breakpoints", op("breakpoints").to(Command::Breakpoints)),
        ));

        let inspect = choice((
            command("threads", op("threads").to(Command::Threads)),
            command("thread", op("thread").ignore_then(number()).map(Command::Thread)),
            command("backtrace", op2("backtrace", "bt").to(Command::Backtrace)),
            command(
                "register",
                op2("register", "reg")
                    .ignore_then(text::ident().padded())
                    .map(|name: &str| Command::Registers(name.to_string())),
            ),
            command(
                "set-register",
                op("set-register")
                    .ignore_then(text::ident().padded())
                    .then(address())
                    .map(|(name, value): (&str, u64)| Command::SetRegister(name.to_string(), value)),
            ),
            command(
                "x",
                op("x")
                    .ignore_then(address())
                    .then(number::<usize>().or_not())
                    .map(|(addr, len)| Command::ExamineMemory(addr, len.unwrap_or(16))),
            ),
            command(
                "write",
                op("write")
                    .ignore_then(address())
                    .then(bytes())
                    .map(|(addr, data)| Command::WriteMemory(addr, data)),
            ),
        ));

        let memory = choice((
            command(
                "mem",
                op("mem")
                    .ignore_then(address())
                    .then(address())
                    .then(mem_access().or_not())
                    .map(|((low, high), access)| {
                        Command::MemRegion(low, high, access.unwrap_or(MemAccess::ReadWrite))
                    }),
            ),
            command(
                "delete-mem",
                op("delete-mem")
                    .ignore_then(number().or_not())
                    .map(Command::DeleteMemRegion),
            ),
            command(
                "enable-mem",
                op("enable-mem")
                    .ignore_then(number())
                    .map(Command::EnableMemRegion),
            ),
            command(
                "disable-mem",
                op("disable-mem")
                    .ignore_then(number())
                    .map(Command::DisableMemRegion),
            ),
            command("regions", op("regions").to(Command::MemRegions)),
            command(
                "overlay-map",
                op("overlay-map").ignore_then(word()).map(Command::OverlayMap),
            ),
            command(
                "overlay-unmap",
                op("overlay-unmap")
                    .ignore_then(word())
                    .map(Command::OverlayUnmap),
            ),
        ));

        choice((session, execution, signals, reverse, breakpoints, inspect, memory)).map_err(
            |e: Rich<'a, char>| {
                let span = *e.span();
                // no command word matched
                if span.start == 0 {
                    Rich::custom(span, "unknown command, type \"help\" for list of commands")
                } else {
                    e
                }
            },
        )
    }
}

pub const HELP: &str = r#"
run, r                      run the program until a stop
start                       create the process, stopped at its first instruction
attach <pid>                attach to a running process
detach | kill               release or kill the process
continue, c                 resume the program
step, s [n] | next, n [n]   step by source lines, into or over calls
stepi, si [n] | nexti, ni   step by instructions
until, u [loc] | advance    run until the next line or a location
finish, fin                 run until the current function returns
jump <loc>                  resume at another location
signal [sig] | queue-signal resume with or queue a signal
handle <sig> [stop|nostop|pass|nopass]
interrupt                   stop the running program
reverse-* (rs, rn, rsi, rni, rc, reverse-finish)
record [stop]               start or stop recording execution
bookmark | bookmarks | goto-bookmark <n|start|end> | delete-bookmark [n]
break, b <loc> | delete, enable, disable <n> | breakpoints
threads | thread <n> | backtrace, bt
register <name> | set-register <name> <value>
x <addr> [len] | write <addr> <hex bytes>
mem <low> <high> [rw|ro|wo|flash|none] | delete-mem [n] | enable-mem, disable-mem <n> | regions
overlay-map <section> | overlay-unmap <section>
target-stack | inferiors | add-inferior | inferior <n> | remove-inferior <n>
file <path> | quit, q
"#;
