//! Subcommand dispatch.
//!
//! Maps each [`Commands`] variant onto the library operation it names and
//! turns the outcome into user-facing output and an exit code.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, ConfigCommand};
use crate::config::{ConfigLoader, ConfigStore};
use crate::deps::DependencyChecker;
use crate::diagnostics::{DiagnosticsProbe, PingResult, PortStatus};
use crate::netns::{
    IpCommandHost, MemoryHost, NamespaceOrchestrator, NetworkHost, OrchestratorOptions, Phase,
    StateStore,
};
use crate::session::{
    EnvironmentReconstructor, EnvironmentStore, ReconstructError, SessionBridge,
    SessionEnvironment, shell_quote,
};

/// File in the state directory receiving the relay's output.
pub const RELAY_LOG_FILE: &str = "relay.log";

/// Handle a parsed command line.
pub fn handle_command(cli: &Cli, loader: &ConfigLoader) -> Result<ExitCode> {
    let load = || loader.load(cli).context("Failed to load configuration");

    match cli.command {
        Commands::Ping { ref host } => ping(&load()?, host.as_deref()),
        Commands::Port { ref host, port } => port_check(&load()?, host.as_deref(), port),
        Commands::Dependencies => dependencies(&load()?),
        Commands::Setup { dry_run: true } => setup_dry_run(&load()?),
        Commands::Setup { dry_run: false } => setup(&load()?),
        Commands::Clean { force } => clean(&load()?, force),
        Commands::Run { ref command } => run(&load()?, command),
        Commands::Env { refresh } => show_env(&load()?, refresh),
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", load()?.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommand::Set { ref key, ref value }) => {
            loader
                .save_user_value(key, value)
                .with_context(|| format!("Failed to set {}", key))?;
            println!("{} = {:?} (in {})", key, value, loader.user_path().display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommand::Path) => {
            println!("{}", loader.user_path().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

fn probe_target(config: &ConfigStore, host: Option<&str>) -> Result<String> {
    match host {
        Some(host) => Ok(host.to_string()),
        None => Ok(config
            .proxy_endpoint()
            .context("No host given and no proxy configured")?
            .0),
    }
}

fn ping(config: &ConfigStore, host: Option<&str>) -> Result<ExitCode> {
    let host = probe_target(config, host)?;
    let probe = DiagnosticsProbe::new(config.probe_timeout()?);

    let result = runtime()?.block_on(probe.ping(&host))?;
    println!("{}: {}", host, result);
    Ok(match result {
        PingResult::Reachable { .. } => ExitCode::SUCCESS,
        PingResult::Unreachable => ExitCode::FAILURE,
    })
}

fn port_check(config: &ConfigStore, host: Option<&str>, port: Option<u16>) -> Result<ExitCode> {
    let host = probe_target(config, host)?;
    let port = match port {
        Some(port) => port,
        None => {
            config
                .proxy_endpoint()
                .context("No port given and no proxy configured")?
                .1
        }
    };
    let probe = DiagnosticsProbe::new(config.probe_timeout()?);

    let status = runtime()?.block_on(probe.port_open(&host, port))?;
    println!("{}:{} is {}", host, port, status);
    Ok(match status {
        PortStatus::Open => ExitCode::SUCCESS,
        PortStatus::Closed | PortStatus::Timeout => ExitCode::FAILURE,
    })
}

fn checker(config: &ConfigStore) -> DependencyChecker {
    DependencyChecker::new().with_relay_binary(&config.relay_options().binary)
}

fn dependencies(config: &ConfigStore) -> Result<ExitCode> {
    let missing = checker(config).check();
    if missing.is_empty() {
        println!("All dependencies are satisfied.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Missing dependencies:");
    for dep in &missing {
        println!("  - {}: {}", dep, dep.hint());
    }
    Ok(ExitCode::FAILURE)
}

fn orchestrator_options(config: &ConfigStore) -> Result<OrchestratorOptions> {
    Ok(OrchestratorOptions {
        relay: config.relay_options(),
        grace_period: config.grace_period()?,
        ..OrchestratorOptions::default()
    })
}

/// Orchestrator for the real host, with state kept in the state directory.
fn host_orchestrator(config: &ConfigStore) -> Result<NamespaceOrchestrator> {
    let state_dir = config.state_dir();
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;

    let host: Arc<dyn NetworkHost> =
        Arc::new(IpCommandHost::new().with_relay_log(state_dir.join(RELAY_LOG_FILE)));
    let orchestrator = NamespaceOrchestrator::with_store(
        host,
        orchestrator_options(config)?,
        StateStore::in_dir(&state_dir),
    )
    .context("Failed to load namespace state")?;
    Ok(orchestrator)
}

fn setup_dry_run(config: &ConfigStore) -> Result<ExitCode> {
    let spec = config.namespace_spec()?;
    let host = Arc::new(MemoryHost::new());
    let orchestrator = NamespaceOrchestrator::new(
        host.clone(),
        OrchestratorOptions {
            settle_delay: Duration::ZERO,
            ..orchestrator_options(config)?
        },
    );

    orchestrator.setup(spec).context("Setup would fail")?;
    for line in host.commands() {
        println!("{}", line);
    }
    Ok(ExitCode::SUCCESS)
}

fn setup(config: &ConfigStore) -> Result<ExitCode> {
    config.require()?;
    let spec = config.namespace_spec()?;
    checker(config).require().context("Refusing to set up")?;

    let orchestrator = host_orchestrator(config)?;
    let handle = orchestrator
        .setup(spec)
        .context("Failed to set up the proxied namespace")?;

    // Capture the caller's session now; elevation wrappers still carry it
    match save_environment(&config.state_dir()) {
        Ok(env) => info!("Captured session environment for {}", env.user),
        Err(e) => warn!("Could not save session environment: {}", e),
    }

    println!(
        "Namespace {} is ready (relay pid {})",
        handle.namespace, handle.pid
    );
    Ok(ExitCode::SUCCESS)
}

fn clean(config: &ConfigStore, force: bool) -> Result<ExitCode> {
    config.require()?;
    let namespace = config.get("namespace").unwrap_or_default().to_string();
    let orchestrator = host_orchestrator(config)?;

    if orchestrator.phase() == Phase::Absent {
        if !force {
            println!(
                "No namespace is recorded in {}; use --force to remove leftovers of '{}'",
                config.state_dir().display(),
                namespace
            );
            return Ok(ExitCode::SUCCESS);
        }
        let found = orchestrator
            .recover(config.namespace_spec()?, None)
            .context("Failed to inspect leftovers")?;
        if found.is_empty() {
            println!("Nothing to clean for '{}'", namespace);
            orchestrator
                .cleanup(&namespace, None)
                .context("Failed to clear recovered state")?;
            return Ok(ExitCode::SUCCESS);
        }
        for resource in &found {
            println!("Found leftover {}", resource);
        }
    }

    let handle = orchestrator.relay_handle();
    orchestrator
        .cleanup(&namespace, handle.as_ref())
        .with_context(|| format!("Failed to clean up namespace {}", namespace))?;
    println!("Namespace {} removed", namespace);
    Ok(ExitCode::SUCCESS)
}

fn run(config: &ConfigStore, command: &[String]) -> Result<ExitCode> {
    config.require()?;
    let namespace = config.get("namespace").unwrap_or_default();
    let command = if command.is_empty() {
        config.command()
    } else {
        Some(
            command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        )
    };

    let env = load_environment(&config.state_dir())?;
    let orchestrator = host_orchestrator(config)?;
    let code = SessionBridge::new()
        .run(&orchestrator, &env, namespace, command.as_deref())
        .with_context(|| format!("Failed to run in namespace {}", namespace))?;

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn show_env(config: &ConfigStore, refresh: bool) -> Result<ExitCode> {
    let state_dir = config.state_dir();
    let env = if refresh {
        save_environment(&state_dir)?
    } else {
        load_environment(&state_dir)?
    };
    println!("{}", serde_json::to_string_pretty(&env)?);
    Ok(ExitCode::SUCCESS)
}

/// The saved environment, or a freshly reconstructed one if none is saved.
fn load_environment(state_dir: &Path) -> Result<SessionEnvironment> {
    match EnvironmentStore::in_dir(state_dir).load() {
        Ok(env) => Ok(env),
        Err(ReconstructError::NotFound { .. }) => save_environment(state_dir),
        Err(e) => Err(e).context("Failed to load session environment"),
    }
}

/// Reconstruct the caller's environment and save it when possible.
fn save_environment(state_dir: &Path) -> Result<SessionEnvironment> {
    let env = EnvironmentReconstructor::from_process()
        .reconstruct()
        .context("Failed to reconstruct session environment")?;
    if let Err(e) = EnvironmentStore::in_dir(state_dir).save(&env) {
        warn!("Could not save session environment: {}", e);
    }
    Ok(env)
}
