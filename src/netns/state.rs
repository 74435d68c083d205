//! Namespace lifecycle state and its on-disk record.
//!
//! ```text
//! ABSENT ──setup──► CREATING ──► READY ──cleanup──► TEARING_DOWN ──► ABSENT
//!                      │                                 │
//!                      └──────────► FAILED ◄─────────────┘
//! ```
//!
//! The state is written to `state.json` after every transition so a separate
//! invocation (`run`, `clean`) sees the phase and the relay PID. An advisory
//! `flock` on `lock` in the same directory orders those invocations: lifecycle
//! changes hold it exclusively, commands running in the namespace hold it
//! shared.

use super::error::StateError;
use super::spec::{Ipv4Cidr, NamespaceSpec};
use crate::persist;
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// State file name inside the state directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Lock file name inside the state directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// Readable by everyone so unprivileged runs can take the shared lock.
const LOCK_FILE_MODE: u32 = 0o644;

/// Lifecycle phase of the namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Nothing exists.
    #[default]
    Absent,
    /// Setup is in progress.
    Creating,
    /// The namespace is routed through the relay and usable.
    Ready,
    /// Cleanup is in progress.
    TearingDown,
    /// Setup or cleanup failed; cleanup must be attempted again.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Absent => "ABSENT",
            Phase::Creating => "CREATING",
            Phase::Ready => "READY",
            Phase::TearingDown => "TEARING_DOWN",
            Phase::Failed => "FAILED",
        })
    }
}

/// Setup steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    /// 1. Create the namespace.
    CreateNamespace,
    /// 2. Create the veth pair and move one end into the namespace.
    CreateVethPair,
    /// 3. Address the veth ends, bring them up, route and NAT via the host end.
    ConfigureVeth,
    /// 4. Create, address and bring up the TUN device.
    CreateTun,
    /// 5. Route non-local traffic through the TUN device.
    RouteThroughTun,
    /// 6. Start the relay.
    StartRelay,
}

impl SetupStep {
    /// All steps in order.
    pub const ALL: [SetupStep; 6] = [
        SetupStep::CreateNamespace,
        SetupStep::CreateVethPair,
        SetupStep::ConfigureVeth,
        SetupStep::CreateTun,
        SetupStep::RouteThroughTun,
        SetupStep::StartRelay,
    ];

    /// One-based step number.
    pub fn number(&self) -> usize {
        *self as usize + 1
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            SetupStep::CreateNamespace => "create namespace",
            SetupStep::CreateVethPair => "create veth pair",
            SetupStep::ConfigureVeth => "configure veth addresses and routing",
            SetupStep::CreateTun => "create TUN device",
            SetupStep::RouteThroughTun => "route traffic through TUN device",
            SetupStep::StartRelay => "start relay",
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.description())
    }
}

/// Teardown steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    /// Stop the relay (SIGTERM, then SIGKILL after the grace period).
    StopRelay,
    /// Delete the TUN device; its routes go with it.
    RemoveTun,
    /// Delete the host veth end; the peer goes with it.
    RemoveVethHost,
    /// Remove the NAT rule for the veth subnet.
    RemoveNatRule,
    /// Delete the namespace.
    DeleteNamespace,
    /// Remove the namespace's resolv.conf.
    RemoveResolvConf,
    /// Switch IPv4 forwarding back off, when setup switched it on.
    RestoreForwarding,
}

impl CleanupStep {
    /// All steps in order.
    pub const ALL: [CleanupStep; 7] = [
        CleanupStep::StopRelay,
        CleanupStep::RemoveTun,
        CleanupStep::RemoveVethHost,
        CleanupStep::RemoveNatRule,
        CleanupStep::DeleteNamespace,
        CleanupStep::RemoveResolvConf,
        CleanupStep::RestoreForwarding,
    ];
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CleanupStep::StopRelay => "stop relay",
            CleanupStep::RemoveTun => "remove TUN device",
            CleanupStep::RemoveVethHost => "remove host veth",
            CleanupStep::RemoveNatRule => "remove NAT rule",
            CleanupStep::DeleteNamespace => "delete namespace",
            CleanupStep::RemoveResolvConf => "remove resolv.conf",
            CleanupStep::RestoreForwarding => "restore IPv4 forwarding",
        })
    }
}

/// A host resource created by setup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    /// A network namespace.
    Namespace {
        /// Namespace name.
        name: String,
    },
    /// A network interface (`namespace: None` means the host).
    Link {
        /// Namespace holding the link.
        namespace: Option<String>,
        /// Interface name.
        name: String,
    },
    /// A route inside a namespace.
    Route {
        /// Namespace holding the route.
        namespace: Option<String>,
        /// Route destination.
        destination: String,
    },
    /// A NAT masquerade rule.
    NatRule {
        /// Masqueraded source subnet.
        source: Ipv4Cidr,
    },
    /// The namespace's resolv.conf.
    ResolvConf {
        /// Namespace name.
        namespace: String,
    },
    /// The relay process.
    Relay {
        /// Relay PID.
        pid: u32,
    },
    /// Host IPv4 forwarding, switched on by setup.
    IpForwarding,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Namespace { name } => write!(f, "namespace {}", name),
            Resource::Link {
                namespace: None,
                name,
            } => write!(f, "link {}", name),
            Resource::Link {
                namespace: Some(ns),
                name,
            } => write!(f, "link {} in namespace {}", name, ns),
            Resource::Route {
                namespace: None,
                destination,
            } => write!(f, "route {}", destination),
            Resource::Route {
                namespace: Some(ns),
                destination,
            } => write!(f, "route {} in namespace {}", destination, ns),
            Resource::NatRule { source } => write!(f, "NAT rule for {}", source),
            Resource::ResolvConf { namespace } => {
                write!(f, "/etc/netns/{}/resolv.conf", namespace)
            }
            Resource::Relay { pid } => write!(f, "relay process {}", pid),
            Resource::IpForwarding => f.write_str("IPv4 forwarding"),
        }
    }
}

/// Handle to a started relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHandle {
    /// Relay PID.
    pub pid: u32,
    /// Namespace the relay serves.
    pub namespace: String,
}

/// Mutable lifecycle state, owned by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceState {
    /// Current phase.
    pub phase: Phase,
    /// Spec the namespace was created from.
    pub spec: Option<NamespaceSpec>,
    /// Relay PID once started.
    pub relay_pid: Option<u32>,
    /// When setup started.
    pub created_at: Option<DateTime<Utc>>,
    /// Resources known to be left behind in FAILED.
    #[serde(default)]
    pub residual: Vec<Resource>,
    /// IPv4 forwarding was off before setup turned it on.
    #[serde(default)]
    pub restore_forwarding: bool,
}

impl NamespaceState {
    /// Name of the managed namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.spec.as_ref().map(|s| s.namespace.as_str())
    }

    /// Relay handle, when a relay is recorded.
    pub fn relay_handle(&self) -> Option<RelayHandle> {
        Some(RelayHandle {
            pid: self.relay_pid?,
            namespace: self.namespace()?.to_string(),
        })
    }

    pub(crate) fn begin(&mut self, spec: NamespaceSpec) {
        *self = NamespaceState {
            phase: Phase::Creating,
            spec: Some(spec),
            relay_pid: None,
            created_at: Some(Utc::now()),
            residual: Vec::new(),
            restore_forwarding: false,
        };
    }

    pub(crate) fn mark_ready(&mut self, pid: u32) {
        self.phase = Phase::Ready;
        self.relay_pid = Some(pid);
        self.residual.clear();
    }

    pub(crate) fn mark_failed(&mut self, residual: Vec<Resource>) {
        self.phase = Phase::Failed;
        self.residual = residual;
    }

    pub(crate) fn reset(&mut self) {
        *self = NamespaceState::default();
    }
}

/// JSON file holding the [`NamespaceState`], plus its lock file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    /// Store at `<dir>/state.json`, locked through `<dir>/lock`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE_NAME),
            lock_path: dir.join(LOCK_FILE_NAME),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Block until no other process holds the lock, then hold it exclusively.
    ///
    /// Creates the lock file when needed. Released when the returned value is
    /// dropped.
    pub fn lock_exclusive(&self) -> Result<Flock<File>, StateError> {
        let file = self.open_lock_file().map_err(|source| StateError::Io {
            path: self.lock_path.clone(),
            source,
        })?;
        self.flock(file, FlockArg::LockExclusive)
    }

    /// Block until no process holds the lock exclusively, then share it.
    ///
    /// `None` when the lock file does not exist and cannot be created: no
    /// setup has ever run with this state directory.
    pub fn lock_shared(&self) -> Result<Option<Flock<File>>, StateError> {
        let file = match self.open_lock_file() {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No lock file at {}", self.lock_path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.lock_path.clone(),
                    source,
                });
            }
        };
        self.flock(file, FlockArg::LockShared).map(Some)
    }

    fn open_lock_file(&self) -> std::io::Result<File> {
        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(&self.lock_path);
        match created {
            // Unprivileged callers can still lock a root-owned file read-only
            Err(e) if e.kind() == ErrorKind::PermissionDenied => File::open(&self.lock_path),
            other => other,
        }
    }

    fn flock(&self, file: File, arg: FlockArg) -> Result<Flock<File>, StateError> {
        Flock::lock(file, arg).map_err(|(_, source)| StateError::Lock {
            path: self.lock_path.clone(),
            source,
        })
    }

    /// Load the recorded state; a missing file means ABSENT.
    pub fn load(&self) -> Result<NamespaceState, StateError> {
        match persist::read_json(&self.path) {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Ok(NamespaceState::default()),
            Err(persist::JsonFileError::Io(source)) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
            Err(persist::JsonFileError::Json(source)) => Err(StateError::Parse {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Write the state atomically.
    pub fn save(&self, state: &NamespaceState) -> Result<(), StateError> {
        persist::write_json(&self.path, state).map_err(|e| match e {
            persist::JsonFileError::Io(source) => StateError::Io {
                path: self.path.clone(),
                source,
            },
            persist::JsonFileError::Json(source) => StateError::Parse {
                path: self.path.clone(),
                source,
            },
        })
    }

    /// Delete the state file; a missing file is fine.
    pub fn remove(&self) -> Result<(), StateError> {
        persist::remove(&self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
