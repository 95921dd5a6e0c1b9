use clap::Parser;
use std::path::PathBuf;
use strata::config::{self, DebuggerConfig};
use strata::console::hook::TerminalHook;
use strata::console::ConsoleApp;
use strata::debugger::symbols::DwarfSymbols;
use strata::debugger::DebuggerBuilder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file, `~/.config/strata/config.toml` if not set
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Attach to a running process
    #[arg(short, long)]
    pid: Option<i32>,

    /// Program to debug
    program: Option<PathBuf>,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => DebuggerConfig::load(path)?,
        None => DebuggerConfig::load_default(),
    };
    config::set(config.clone());

    let mut builder = DebuggerBuilder::new()
        .with_config(config)
        .with_hooks(TerminalHook);
    if let Some(program) = args.program.as_deref() {
        match DwarfSymbols::load(program) {
            Ok(symbols) => builder = builder.with_symbols(symbols),
            Err(e) => log::warn!(target: "debugger", "no debug information in {}: {e}", program.display()),
        }
    }
    let mut debugger = builder.build()?;
    debugger.install_signal_handlers()?;

    if let Some(program) = args.program {
        debugger.exec_file(&program)?;
        debugger.set_program(program, args.args);
    }
    if let Some(pid) = args.pid {
        let ptid = debugger.attach(pid)?;
        println!("Attached to {ptid}");
    }

    ConsoleApp::new(debugger)?.run()
}
