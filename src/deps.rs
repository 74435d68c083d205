//! Host prerequisite checks.
//!
//! [`DependencyChecker::check`] looks for everything setup and run rely on
//! and reports what is absent. It never changes the host.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::netns::relay::DEFAULT_RELAY_BINARY;
use crate::session::bridge::ELEVATION_TOOLS;

/// TUN clone device.
pub const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// Directories searched in addition to `PATH`; iproute2 and iptables live in
/// sbin, which unprivileged users often lack.
const SBIN_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

const CAP_NET_ADMIN: u32 = 12;
const CAP_SYS_ADMIN: u32 = 21;

/// Something setup or run needs that the host does not have.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MissingDependency {
    /// iproute2 `ip`.
    IpRoute,
    /// `iptables`.
    Iptables,
    /// The TUN-to-proxy relay executable.
    Relay {
        /// Configured binary name or path.
        binary: String,
    },
    /// util-linux `setpriv`.
    Setpriv,
    /// None of `sudo`, `pkexec` or `doas`.
    ElevationTool,
    /// The TUN clone device.
    TunDevice {
        /// Where it was expected.
        path: PathBuf,
    },
    /// Neither root nor CAP_NET_ADMIN plus CAP_SYS_ADMIN.
    Privilege,
}

impl MissingDependency {
    /// How to fix it.
    pub fn hint(&self) -> &'static str {
        match self {
            MissingDependency::IpRoute => "install the iproute2 package",
            MissingDependency::Iptables => "install the iptables package",
            MissingDependency::Relay { .. } => {
                "install tun2socks (https://github.com/xjasonlyu/tun2socks) or set relay_binary"
            }
            MissingDependency::Setpriv => "install util-linux",
            MissingDependency::ElevationTool => "install sudo, doas or polkit (pkexec)",
            MissingDependency::TunDevice { .. } => "load the kernel module with 'modprobe tun'",
            MissingDependency::Privilege => "run as root or grant cap_net_admin,cap_sys_admin",
        }
    }
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingDependency::IpRoute => write!(f, "ip (iproute2)"),
            MissingDependency::Iptables => write!(f, "iptables"),
            MissingDependency::Relay { binary } => write!(f, "relay executable '{}'", binary),
            MissingDependency::Setpriv => write!(f, "setpriv"),
            MissingDependency::ElevationTool => write!(f, "elevation tool (sudo, pkexec or doas)"),
            MissingDependency::TunDevice { path } => write!(f, "TUN device {}", path.display()),
            MissingDependency::Privilege => {
                write!(f, "privilege to manage namespaces (root or CAP_NET_ADMIN + CAP_SYS_ADMIN)")
            }
        }
    }
}

/// The host is missing prerequisites.
#[derive(Debug, Error)]
#[error("Missing dependencies: {}", list(.0))]
pub struct DependencyError(pub BTreeSet<MissingDependency>);

fn list(missing: &BTreeSet<MissingDependency>) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Finds which prerequisites are absent.
#[derive(Debug, Clone)]
pub struct DependencyChecker {
    relay_binary: String,
    search_path: OsString,
    tun_device: PathBuf,
    proc_status: PathBuf,
    euid: u32,
}

impl DependencyChecker {
    /// Checker for the current process and the default relay.
    pub fn new() -> Self {
        let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        for dir in SBIN_DIRS {
            let dir = PathBuf::from(dir);
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }

        Self {
            relay_binary: DEFAULT_RELAY_BINARY.to_string(),
            search_path: std::env::join_paths(dirs).unwrap_or_default(),
            tun_device: PathBuf::from(TUN_DEVICE_PATH),
            proc_status: PathBuf::from("/proc/self/status"),
            euid: nix::unistd::geteuid().as_raw(),
        }
    }

    /// Look for this relay instead of `tun2socks`.
    pub fn with_relay_binary(mut self, binary: &str) -> Self {
        self.relay_binary = binary.to_string();
        self
    }

    /// Search these directories for executables.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = path.into();
        self
    }

    /// Expect the TUN device here.
    pub fn with_tun_device(mut self, path: PathBuf) -> Self {
        self.tun_device = path;
        self
    }

    /// Judge privilege from this euid and `/proc/<pid>/status`-style file.
    pub fn with_identity(mut self, euid: u32, proc_status: PathBuf) -> Self {
        self.euid = euid;
        self.proc_status = proc_status;
        self
    }

    /// Every missing prerequisite; empty when the host is ready.
    pub fn check(&self) -> BTreeSet<MissingDependency> {
        let mut missing = BTreeSet::new();

        if !self.has_program("ip") {
            missing.insert(MissingDependency::IpRoute);
        }
        if !self.has_program("iptables") {
            missing.insert(MissingDependency::Iptables);
        }
        if !self.has_program(&self.relay_binary) {
            missing.insert(MissingDependency::Relay {
                binary: self.relay_binary.clone(),
            });
        }
        if !self.has_program("setpriv") {
            missing.insert(MissingDependency::Setpriv);
        }
        if !ELEVATION_TOOLS.iter().any(|tool| self.has_program(tool)) {
            missing.insert(MissingDependency::ElevationTool);
        }
        if !self.tun_device.exists() {
            missing.insert(MissingDependency::TunDevice {
                path: self.tun_device.clone(),
            });
        }
        if !self.privileged() {
            missing.insert(MissingDependency::Privilege);
        }

        debug!("Dependency check: {} missing", missing.len());
        missing
    }

    /// [`check`](Self::check) as a `Result`.
    pub fn require(&self) -> Result<(), DependencyError> {
        let missing = self.check();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DependencyError(missing))
        }
    }

    fn has_program(&self, name: &str) -> bool {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        match which::which_in(name, Some(&self.search_path), cwd) {
            Ok(path) => {
                debug!("Found {} at {:?}", name, path);
                true
            }
            Err(_) => false,
        }
    }

    fn privileged(&self) -> bool {
        if self.euid == 0 {
            return true;
        }
        match effective_capabilities(&self.proc_status) {
            Some(caps) => has_cap(caps, CAP_NET_ADMIN) && has_cap(caps, CAP_SYS_ADMIN),
            None => false,
        }
    }
}

impl Default for DependencyChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn has_cap(mask: u64, cap: u32) -> bool {
    mask & (1u64 << cap) != 0
}

/// The `CapEff` mask from a proc status file.
fn effective_capabilities(status: &Path) -> Option<u64> {
    let content = fs::read_to_string(status).ok()?;
    parse_cap_eff(&content)
}

fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}
