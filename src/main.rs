//! proxyns: run programs in a network namespace routed through a proxy.
//!
//! This is the main entry point for the proxyns binary. It handles CLI
//! argument parsing, logging and telemetry initialization, then hands the
//! subcommand to the dispatcher.
//!
//! # I/O Architecture
//!
//! - **Audit logging**: goes to syslog, never to stdout/stderr
//! - **Debug logging**: `tracing` to stderr, controlled by `-v` or `RUST_LOG`
//! - **Command output**: stdout; `run` hands the terminal to the command

use anyhow::{Context, Result};
use clap::Parser;
use proxyns::{cli::Cli, cli_handler, config::ConfigLoader, telemetry};
use std::process::ExitCode;
use tracing::{debug, warn};

fn main() -> ExitCode {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    match try_main(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: Cli) -> Result<ExitCode> {
    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    if !cli.audited() {
        telemetry::init_null_logger();
    } else if let Err(e) = telemetry::init_logger() {
        // Syslog may be missing (containers); audit events are then dropped
        warn!("Audit logging disabled: {}", e);
    }

    let loader = ConfigLoader::new();
    cli_handler::handle_command(&cli, &loader)
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors, unless `RUST_LOG` is set
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
