/// Lunar CLI.
///
/// `lunar run <module.json>` loads a LuaJIT-compatible JSON bytecode
/// dump and executes its chunk function. Uncaught guest errors print to
/// stderr and exit nonzero; everything else is a loader diagnostic.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lunar::{parse_from_json, Vm, VmError};

#[derive(Parser)]
#[command(name = "lunar", about = "A NaN-boxed, hidden-class Lua VM core", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a JSON bytecode module.
    Run {
        /// Path to the bytecode dump.
        module: String,
        /// Coroutine stack size in value slots.
        #[arg(long, default_value_t = 1 << 16)]
        stack_slots: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { module, stack_slots } => match run(&module, stack_slots) {
            Ok(()) => ExitCode::SUCCESS,
            Err(RunFailure::Uncaught(msg)) => {
                eprintln!("Uncaught error: {}", msg);
                ExitCode::FAILURE
            }
            Err(RunFailure::Host(e)) => {
                eprintln!("lunar: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

enum RunFailure {
    Uncaught(String),
    Host(anyhow::Error),
}

fn run(path: &str, stack_slots: u32) -> Result<(), RunFailure> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read module '{}'", path))
        .map_err(RunFailure::Host)?;
    let mut vm = Vm::with_stack_slots(stack_slots)
        .map_err(|e| RunFailure::Host(e.into()))?;
    let module = parse_from_json(&mut vm, &content)
        .map_err(|e| RunFailure::Host(anyhow::Error::from(e)))?;
    match vm.launch_script(&module) {
        Ok(_) => Ok(()),
        Err(VmError::Uncaught(msg)) => Err(RunFailure::Uncaught(msg)),
        Err(e) => Err(RunFailure::Host(e.into())),
    }
}
