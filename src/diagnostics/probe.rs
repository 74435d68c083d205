//! ICMP and TCP probes.

use super::error::DiagnosticsError;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Probe timeout used when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra time `ping` gets beyond its own deadline before it is killed.
const PING_SLACK: Duration = Duration::from_secs(1);

/// Outcome of a ping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PingResult {
    /// An echo reply came back.
    Reachable {
        /// Average round-trip time in milliseconds, when `ping` reported one.
        rtt_ms: Option<f64>,
    },
    /// No reply within the timeout.
    Unreachable,
}

impl fmt::Display for PingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingResult::Reachable { rtt_ms: Some(rtt) } => write!(f, "reachable ({:.1} ms)", rtt),
            PingResult::Reachable { rtt_ms: None } => f.write_str("reachable"),
            PingResult::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Outcome of a TCP connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    /// The connection was accepted.
    Open,
    /// The host refused the connection.
    Closed,
    /// Nothing answered in time (dropped, filtered or unroutable).
    Timeout,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Timeout => "timeout",
        })
    }
}

/// Runs reachability checks with one timeout.
#[derive(Debug, Clone)]
pub struct DiagnosticsProbe {
    timeout: Duration,
}

impl Default for DiagnosticsProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl DiagnosticsProbe {
    /// Probe with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Send one ICMP echo request with the system `ping`.
    pub async fn ping(&self, host: &str) -> Result<PingResult, DiagnosticsError> {
        let host = validate_host(host)?;
        let wait_secs = self.timeout.as_secs().max(1);

        let mut cmd = Command::new("ping");
        cmd.args(["-n", "-c", "1", "-W", &wait_secs.to_string(), host])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Running: ping -n -c 1 -W {} {}", wait_secs, host);

        let output = match tokio::time::timeout(
            Duration::from_secs(wait_secs) + PING_SLACK,
            cmd.output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(DiagnosticsError::PingUnavailable(e)),
            Err(_) => {
                debug!("ping {} did not finish in time", host);
                return Ok(PingResult::Unreachable);
            }
        };

        if !output.status.success() {
            debug!(
                "ping {} failed: {}",
                host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(PingResult::Unreachable);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(PingResult::Reachable {
            rtt_ms: parse_rtt(&stdout),
        })
    }

    /// Try a TCP connection to `host:port`.
    pub async fn port_open(&self, host: &str, port: u16) -> Result<PortStatus, DiagnosticsError> {
        let host = validate_host(host)?;
        let addr = self.resolve(host, port).await?;
        let Some(addr) = addr else {
            return Ok(PortStatus::Timeout);
        };

        debug!("Connecting to {}", addr);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(PortStatus::Open),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(PortStatus::Closed),
            Ok(Err(e)) => {
                // Unreachable routes fail fast but mean the same as a silent drop
                debug!("Connect to {} failed: {}", addr, e);
                Ok(PortStatus::Timeout)
            }
            Err(_) => Ok(PortStatus::Timeout),
        }
    }

    /// First address for `host`, preferring IPv4; `None` if resolution timed out.
    async fn resolve(&self, host: &str, port: u16) -> Result<Option<SocketAddr>, DiagnosticsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Some(SocketAddr::new(ip, port)));
        }

        let lookup = tokio::net::lookup_host((host, port));
        let addrs: Vec<SocketAddr> = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(source)) => {
                return Err(DiagnosticsError::Resolve {
                    host: host.to_string(),
                    source,
                });
            }
            Err(_) => return Ok(None),
        };

        let first = addrs.iter().find(|a| a.is_ipv4()).or(addrs.first()).copied();
        first.map(Some).ok_or_else(|| DiagnosticsError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        })
    }
}

/// Reject anything that is not a plausible hostname or IP literal.
///
/// IPv6 literals come back without their URL brackets.
fn validate_host(host: &str) -> Result<&str, DiagnosticsError> {
    let invalid = |reason: &str| DiagnosticsError::InvalidHost {
        host: host.to_string(),
        reason: reason.to_string(),
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(invalid("empty"));
    }
    if host.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }
    // Would be taken as an option by ping
    if host.starts_with('-') {
        return Err(invalid("starts with '-'"));
    }
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if literal.parse::<IpAddr>().is_ok() {
        return Ok(literal);
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(invalid("contains characters not allowed in a hostname"));
    }
    if host.split('.').any(|label| label.is_empty() || label.len() > 63) {
        return Err(invalid("has an empty or overlong label"));
    }
    Ok(host)
}

/// Average RTT from ping's summary, falling back to the first reply's `time=`.
fn parse_rtt(output: &str) -> Option<f64> {
    let summary = output.lines().find_map(|line| {
        let line = line.trim();
        if !(line.starts_with("rtt") || line.starts_with("round-trip")) {
            return None;
        }
        let (_, values) = line.split_once('=')?;
        values.trim().split('/').nth(1)?.trim().parse::<f64>().ok()
    });
    summary.or_else(|| {
        output.lines().find_map(|line| {
            let (_, rest) = line.split_once("time=")?;
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
    })
}
