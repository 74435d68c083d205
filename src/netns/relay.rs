//! TUN-to-proxy relay process: command line and shutdown.
//!
//! The relay (tun2socks by default) reads packets from the namespace's TUN
//! device and forwards them through the proxy endpoint. Only its lifecycle is
//! managed here; it is expected to run until signalled.

use super::error::HostError;
use super::host::NetworkHost;
use super::spec::NamespaceSpec;
use nix::sys::signal::Signal;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Relay executable used when none is configured.
pub const DEFAULT_RELAY_BINARY: &str = "tun2socks";

/// Relay log level used when none is configured.
pub const DEFAULT_RELAY_LOG_LEVEL: &str = "warn";

/// Interval between liveness checks while waiting for the relay to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the relay to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// How the relay is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Executable name or path.
    pub binary: String,
    /// Extra arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Value for `-loglevel`.
    pub log_level: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            binary: DEFAULT_RELAY_BINARY.to_string(),
            extra_args: Vec::new(),
            log_level: DEFAULT_RELAY_LOG_LEVEL.to_string(),
        }
    }
}

/// A fully resolved relay command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl RelayCommand {
    /// `tun2socks -device tun://<tun> -proxy <url> -loglevel <level> [extra...]`
    pub fn for_spec(spec: &NamespaceSpec, options: &RelayOptions) -> Self {
        let mut args = vec![
            "-device".to_string(),
            format!("tun://{}", spec.tun_interface),
            "-proxy".to_string(),
            spec.socks_url.as_str().to_string(),
            "-loglevel".to_string(),
            options.log_level.clone(),
        ];
        args.extend(options.extra_args.iter().cloned());
        Self {
            program: options.binary.clone(),
            args,
        }
    }

    /// Command line for logs, with the proxy credentials hidden.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                parts.push(redact_userinfo(arg));
                hide_next = false;
            } else {
                hide_next = arg == "-proxy";
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

fn redact_userinfo(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{}://***@{}", scheme, &url[at + 1..]),
        _ => url.to_string(),
    }
}

/// How the relay went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// It was not running.
    AlreadyExited,
    /// It exited after SIGTERM.
    Terminated,
    /// It had to be killed.
    Killed,
}

/// Stop the relay: SIGTERM, wait up to `grace`, then SIGKILL.
pub fn stop_relay(
    host: &dyn NetworkHost,
    pid: u32,
    grace: Duration,
) -> Result<StopOutcome, HostError> {
    if !host.process_alive(pid) {
        debug!("Relay {} is not running", pid);
        return Ok(StopOutcome::AlreadyExited);
    }

    match host.signal(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(HostError::NoSuchProcess { .. }) => return Ok(StopOutcome::AlreadyExited),
        Err(e) => return Err(e),
    }

    if wait_for_exit(host, pid, grace) {
        info!("Relay {} terminated", pid);
        return Ok(StopOutcome::Terminated);
    }

    warn!(
        "Relay {} still running after {:?}, sending SIGKILL",
        pid, grace
    );
    match host.signal(pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(HostError::NoSuchProcess { .. }) => return Ok(StopOutcome::Terminated),
        Err(e) => return Err(e),
    }

    if wait_for_exit(host, pid, KILL_WAIT) {
        Ok(StopOutcome::Killed)
    } else {
        Err(HostError::ProcessSurvived { pid })
    }
}

/// Poll until the process is gone or `timeout` elapses.
fn wait_for_exit(host: &dyn NetworkHost, pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !host.process_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}
