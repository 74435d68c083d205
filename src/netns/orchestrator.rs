//! The namespace lifecycle state machine.
//!
//! [`NamespaceOrchestrator`] owns the [`NamespaceState`] behind one `RwLock`.
//! Setup, cleanup and recovery hold the write lock for their whole duration,
//! so two callers can never interleave kernel mutations. Commands run inside
//! the namespace hold a [`ReadyGuard`] (the read lock) for as long as they
//! run, which lets any number of them proceed together while keeping setup
//! and cleanup out.
//!
//! With a [`StateStore`] the same rules hold across processes: the write
//! paths take the store's lock file exclusively and reload the state from
//! disk before looking at it, and a [`ReadyGuard`] holds the lock file
//! shared. The in-process lock is always taken first.
//!
//! Setup records the inverse of every completed mutation in a rollback
//! ledger. When a step fails the ledger is unwound in reverse; whatever cannot
//! be removed is reported as residue and kept in the state for a later
//! cleanup.

use super::error::{
    CleanupError, CleanupFailure, HostError, ReadyError, SetupError, StateError,
};
use super::host::{HostOp, NetworkHost, RouteSpec};
use super::relay::{self, RelayCommand, RelayOptions, StopOutcome};
use super::spec::{Ipv4Cidr, NamespaceSpec};
use super::state::{
    CleanupStep, NamespaceState, Phase, RelayHandle, Resource, SetupStep, StateStore,
};
use crate::telemetry::{self, AuditEvent};
use nix::fcntl::Flock;
use std::fs::File;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time the relay gets to exit after SIGTERM.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default wait before checking that a freshly started relay survived.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// How to invoke the relay.
    pub relay: RelayOptions,
    /// SIGTERM-to-SIGKILL grace period.
    pub grace_period: Duration,
    /// Delay before the relay liveness check.
    pub settle_delay: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            relay: RelayOptions::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// An entry in the rollback ledger.
#[derive(Debug)]
enum Undo {
    Op(HostOp),
    Relay(u32),
}

/// Shared access to a READY namespace.
///
/// Setup and cleanup block until every guard is dropped, in this process and
/// in any other process sharing the state directory.
pub struct ReadyGuard<'a> {
    _local: RwLockReadGuard<'a, NamespaceState>,
    _file: Option<Flock<File>>,
    namespace: String,
    relay_pid: Option<u32>,
}

impl ReadyGuard<'_> {
    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Relay PID.
    pub fn relay_pid(&self) -> Option<u32> {
        self.relay_pid
    }
}

/// Held across a lifecycle change; `None` without a store.
type LifecycleLock = Option<Flock<File>>;

/// Creates, tracks and removes one proxied namespace.
pub struct NamespaceOrchestrator {
    host: Arc<dyn NetworkHost>,
    state: RwLock<NamespaceState>,
    store: Option<StateStore>,
    options: OrchestratorOptions,
}

impl NamespaceOrchestrator {
    /// An orchestrator with in-memory state only.
    pub fn new(host: Arc<dyn NetworkHost>, options: OrchestratorOptions) -> Self {
        Self {
            host,
            state: RwLock::new(NamespaceState::default()),
            store: None,
            options,
        }
    }

    /// An orchestrator whose state is loaded from and saved to `store`.
    ///
    /// A record left in CREATING or TEARING_DOWN belongs to a process that
    /// died mid-operation; it is loaded as FAILED so cleanup can finish it.
    pub fn with_store(
        host: Arc<dyn NetworkHost>,
        options: OrchestratorOptions,
        store: StateStore,
    ) -> Result<Self, StateError> {
        let state = load_state(&store)?;
        Ok(Self {
            host,
            state: RwLock::new(state),
            store: Some(store),
            options,
        })
    }

    /// The host this orchestrator mutates.
    pub fn host(&self) -> &dyn NetworkHost {
        self.host.as_ref()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    /// Copy of the current state.
    pub fn state(&self) -> NamespaceState {
        self.read().clone()
    }

    /// Handle of the running relay, if any.
    pub fn relay_handle(&self) -> Option<RelayHandle> {
        self.read().relay_handle()
    }

    fn read(&self) -> RwLockReadGuard<'_, NamespaceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NamespaceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write lock plus the exclusive file lock, with the state reloaded.
    fn lock_for_change(
        &self,
    ) -> Result<(RwLockWriteGuard<'_, NamespaceState>, LifecycleLock), StateError> {
        let mut state = self.write();
        let Some(ref store) = self.store else {
            return Ok((state, None));
        };
        let file = store.lock_exclusive()?;
        *state = load_state(store)?;
        Ok((state, Some(file)))
    }

    fn persist(&self, state: &NamespaceState) -> Result<(), StateError> {
        match self.store {
            Some(ref store) => store.save(state),
            None => Ok(()),
        }
    }

    fn persist_or_warn(&self, state: &NamespaceState) {
        if let Err(e) = self.persist(state) {
            warn!("Failed to record namespace state: {}", e);
        }
    }

    /// Lock the state for a command run inside the namespace.
    ///
    /// With a store the phase is taken from disk, under the shared file lock.
    pub fn read_ready(&self, namespace: &str) -> Result<ReadyGuard<'_>, ReadyError> {
        let local = self.read();
        let (file, current) = match self.store {
            Some(ref store) => {
                let file = store.lock_shared()?;
                let state = match file {
                    Some(_) => load_state(store)?,
                    None => NamespaceState::default(),
                };
                (file, state)
            }
            None => (None, local.clone()),
        };

        if current.phase != Phase::Ready {
            return Err(ReadyError::NotReady {
                phase: current.phase,
            });
        }
        let current_ns = current.namespace().unwrap_or_default();
        if current_ns != namespace {
            return Err(ReadyError::NamespaceMismatch {
                expected: current_ns.to_string(),
                requested: namespace.to_string(),
            });
        }
        Ok(ReadyGuard {
            namespace: current_ns.to_string(),
            relay_pid: current.relay_pid,
            _local: local,
            _file: file,
        })
    }

    /// Create the namespace, wire it to the relay and start the relay.
    pub fn setup(&self, spec: NamespaceSpec) -> Result<RelayHandle, SetupError> {
        spec.validate()?;
        let (mut state, _lock) = self.lock_for_change()?;

        match state.phase {
            Phase::Absent => {}
            Phase::Ready => {
                if state.spec.as_ref() == Some(&spec)
                    && let Some(handle) = state.relay_handle()
                {
                    info!("Namespace {} is already READY", spec.namespace);
                    return Ok(handle);
                }
                return Err(SetupError::Conflict {
                    namespace: state.namespace().unwrap_or_default().to_string(),
                });
            }
            phase => return Err(SetupError::InvalidPhase { phase }),
        }

        self.check_host_conflicts(&spec)?;

        state.begin(spec.clone());
        if let Err(e) = self.persist(&state) {
            state.reset();
            return Err(e.into());
        }
        info!("Setting up namespace {}", spec.namespace);

        let mut ledger = Vec::new();
        for step in SetupStep::ALL {
            debug!("Setup step {}", step);
            if let Err(source) = self.run_step(step, &spec, &mut ledger) {
                error!("Setup step {} failed: {}", step, source);
                let residual = self.rollback(ledger);
                state.restore_forwarding = residual.contains(&Resource::IpForwarding);
                state.mark_failed(residual.clone());
                self.persist_or_warn(&state);

                let err = if residual.is_empty() {
                    SetupError::StepFailed {
                        step,
                        phase: state.phase,
                        source,
                    }
                } else {
                    SetupError::RollbackIncomplete {
                        step,
                        phase: state.phase,
                        source,
                        residual,
                    }
                };
                telemetry::record(AuditEvent::SetupFailed {
                    namespace: spec.namespace.clone(),
                    step: Some(step.to_string()),
                    phase: state.phase.to_string(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        }

        let pid = ledger
            .iter()
            .find_map(|undo| match undo {
                Undo::Relay(pid) => Some(*pid),
                Undo::Op(_) => None,
            })
            .unwrap_or_default();
        state.restore_forwarding = ledger
            .iter()
            .any(|undo| matches!(undo, Undo::Op(HostOp::DisableForwarding)));
        state.mark_ready(pid);
        self.persist_or_warn(&state);

        info!(
            "Namespace {} is READY (relay PID {})",
            spec.namespace, pid
        );
        telemetry::record(AuditEvent::NamespaceSetup {
            namespace: spec.namespace.clone(),
            relay_pid: pid,
            proxy: spec.socks_url.redacted(),
        });

        Ok(RelayHandle {
            pid,
            namespace: spec.namespace,
        })
    }

    fn check_host_conflicts(&self, spec: &NamespaceSpec) -> Result<(), SetupError> {
        if self.host.namespace_exists(&spec.namespace) {
            return Err(SetupError::AlreadyExists {
                resource: Resource::Namespace {
                    name: spec.namespace.clone(),
                },
            });
        }
        for link in [&spec.veth_host, &spec.veth_ns] {
            if self.host.link_exists(None, link) {
                return Err(SetupError::AlreadyExists {
                    resource: Resource::Link {
                        namespace: None,
                        name: link.clone(),
                    },
                });
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        step: SetupStep,
        spec: &NamespaceSpec,
        ledger: &mut Vec<Undo>,
    ) -> Result<(), HostError> {
        if step == SetupStep::StartRelay {
            return self.start_relay(spec, ledger);
        }
        for op in step_ops(step, spec) {
            // Forwarding someone else switched on stays on
            if op == HostOp::EnableForwarding && self.host.forwarding_enabled() {
                debug!("IPv4 forwarding is already enabled");
                continue;
            }
            self.host.apply(&op)?;
            if let Some(inverse) = op.inverse() {
                ledger.push(Undo::Op(inverse));
            }
        }
        Ok(())
    }

    fn start_relay(&self, spec: &NamespaceSpec, ledger: &mut Vec<Undo>) -> Result<(), HostError> {
        let command = RelayCommand::for_spec(spec, &self.options.relay);
        let pid = self.host.spawn_relay(&spec.namespace, &command)?;
        ledger.push(Undo::Relay(pid));

        if !self.options.settle_delay.is_zero() {
            thread::sleep(self.options.settle_delay);
        }
        if !self.host.process_alive(pid) {
            return Err(HostError::RelayExited { pid });
        }
        Ok(())
    }

    /// Undo completed mutations in reverse; returns what is still present.
    fn rollback(&self, ledger: Vec<Undo>) -> Vec<Resource> {
        let mut failed = Vec::new();
        for undo in ledger.into_iter().rev() {
            match undo {
                Undo::Relay(pid) => {
                    if let Err(e) = relay::stop_relay(self.host(), pid, self.options.grace_period) {
                        warn!("Rollback: failed to stop relay {}: {}", pid, e);
                        failed.push(Resource::Relay { pid });
                    }
                }
                Undo::Op(op) => {
                    debug!("Rollback: {}", op.command_line());
                    if let Err(e) = self.host.apply(&op) {
                        warn!("Rollback: {} failed: {}", op.command_line(), e);
                        if let Some(resource) = op.target() {
                            failed.push(resource);
                        }
                    }
                }
            }
        }
        // A failed removal may have been made moot by a later one (routes go
        // away with their namespace)
        failed.retain(|r| self.still_present(r));
        failed
    }

    fn still_present(&self, resource: &Resource) -> bool {
        match resource {
            Resource::Namespace { name } => self.host.namespace_exists(name),
            Resource::Link {
                namespace: Some(ns),
                name,
            } => self.host.namespace_exists(ns) && self.host.link_exists(Some(ns), name),
            Resource::Link {
                namespace: None,
                name,
            } => self.host.link_exists(None, name),
            Resource::Route {
                namespace: Some(ns),
                ..
            } => self.host.namespace_exists(ns),
            Resource::Route { namespace: None, .. } => true,
            Resource::NatRule { source } => self.host.masquerade_exists(source),
            Resource::ResolvConf { namespace } => self.host.resolv_conf_exists(namespace),
            Resource::Relay { pid } => self.host.process_alive(*pid),
            Resource::IpForwarding => self.host.forwarding_enabled(),
        }
    }

    /// Everything `spec` would create that currently exists on the host.
    pub fn detect_resources(&self, spec: &NamespaceSpec) -> Vec<Resource> {
        let candidates = [
            Resource::Link {
                namespace: Some(spec.namespace.clone()),
                name: spec.tun_interface.clone(),
            },
            Resource::Link {
                namespace: None,
                name: spec.veth_host.clone(),
            },
            Resource::NatRule {
                source: spec.veth_subnet(),
            },
            Resource::Namespace {
                name: spec.namespace.clone(),
            },
            Resource::ResolvConf {
                namespace: spec.namespace.clone(),
            },
        ];
        candidates
            .into_iter()
            .filter(|r| self.still_present(r))
            .collect()
    }

    /// Adopt leftovers of `spec` from a crashed run so cleanup can remove them.
    ///
    /// Only allowed with no recorded state; the state becomes FAILED with
    /// whatever resources are found on the host. IPv4 forwarding is left
    /// alone since nothing records whether setup switched it on.
    pub fn recover(
        &self,
        spec: NamespaceSpec,
        relay_pid: Option<u32>,
    ) -> Result<Vec<Resource>, SetupError> {
        spec.validate()?;
        let (mut state, _lock) = self.lock_for_change()?;
        if state.phase != Phase::Absent {
            return Err(SetupError::InvalidPhase { phase: state.phase });
        }

        let mut found = self.detect_resources(&spec);
        let relay_pid = relay_pid.filter(|pid| self.host.process_alive(*pid));
        if let Some(pid) = relay_pid {
            found.insert(0, Resource::Relay { pid });
        }

        info!(
            "Recovering namespace {}: {} leftover resource(s)",
            spec.namespace,
            found.len()
        );
        state.begin(spec);
        state.relay_pid = relay_pid;
        state.mark_failed(found.clone());
        self.persist(&state)?;
        Ok(found)
    }

    /// Tear everything down, attempting every step even when some fail.
    pub fn cleanup(
        &self,
        namespace: &str,
        relay_handle: Option<&RelayHandle>,
    ) -> Result<(), CleanupError> {
        let (mut state, _lock) = self.lock_for_change()?;

        if !matches!(state.phase, Phase::Ready | Phase::Failed) {
            return Err(CleanupError::InvalidPhase { phase: state.phase });
        }
        let Some(spec) = state.spec.clone() else {
            return Err(CleanupError::InvalidPhase { phase: state.phase });
        };
        if spec.namespace != namespace {
            return Err(CleanupError::NamespaceMismatch {
                expected: spec.namespace,
                requested: namespace.to_string(),
            });
        }
        let relay_pid = match (state.relay_pid, relay_handle) {
            (Some(expected), Some(handle)) if handle.pid != expected => {
                return Err(CleanupError::RelayMismatch {
                    expected,
                    given: handle.pid,
                });
            }
            (Some(pid), _) => Some(pid),
            (None, Some(handle)) if handle.namespace == namespace => Some(handle.pid),
            (None, _) => None,
        };

        let restore_forwarding = state.restore_forwarding;

        info!("Cleaning up namespace {}", namespace);
        state.phase = Phase::TearingDown;
        self.persist_or_warn(&state);

        let mut failures = Vec::new();
        let mut relay_stopped = true;
        for step in CleanupStep::ALL {
            let result = match step {
                CleanupStep::StopRelay => match relay_pid {
                    Some(pid) => self.stop_relay_step(pid),
                    None => Ok(()),
                },
                CleanupStep::RestoreForwarding if !restore_forwarding => Ok(()),
                _ => match cleanup_op(step, &spec) {
                    Some((resource, op)) => self
                        .remove_if_present(&resource, &op)
                        .map_err(|e| (resource, e)),
                    None => Ok(()),
                },
            };
            if let Err((resource, error)) = result {
                warn!("Cleanup step '{}' failed: {}", step, error);
                if step == CleanupStep::StopRelay {
                    relay_stopped = false;
                }
                failures.push(CleanupFailure {
                    step,
                    resource,
                    error,
                });
            }
        }

        if failures.is_empty() {
            state.reset();
            if let Some(ref store) = self.store
                && let Err(e) = store.remove()
            {
                warn!("Failed to remove state file: {}", e);
            }
            info!("Namespace {} removed", namespace);
            telemetry::record(AuditEvent::NamespaceCleanup {
                namespace: namespace.to_string(),
                relay_pid,
            });
            return Ok(());
        }

        if relay_stopped {
            state.relay_pid = None;
        }
        state.restore_forwarding = failures
            .iter()
            .any(|f| f.resource == Resource::IpForwarding);
        state.mark_failed(failures.iter().map(|f| f.resource.clone()).collect());
        self.persist_or_warn(&state);
        telemetry::record(AuditEvent::CleanupFailed {
            namespace: namespace.to_string(),
            failures: failures.iter().map(ToString::to_string).collect(),
        });
        Err(CleanupError::Incomplete {
            phase: state.phase,
            failures,
        })
    }

    fn stop_relay_step(&self, pid: u32) -> Result<(), (Resource, HostError)> {
        match relay::stop_relay(self.host(), pid, self.options.grace_period) {
            Ok(StopOutcome::AlreadyExited) => {
                debug!("Relay {} had already exited", pid);
                Ok(())
            }
            Ok(outcome) => {
                debug!("Relay {} stopped: {:?}", pid, outcome);
                Ok(())
            }
            Err(e) => Err((Resource::Relay { pid }, e)),
        }
    }

    fn remove_if_present(&self, resource: &Resource, op: &HostOp) -> Result<(), HostError> {
        if !self.still_present(resource) {
            debug!("{} already gone", resource);
            return Ok(());
        }
        match self.host.apply(op) {
            Ok(()) => Ok(()),
            // Lost a race with something else removing it
            Err(_) if !self.still_present(resource) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Load the recorded state; an operation interrupted by a dead process loads
/// as FAILED so cleanup can finish it.
fn load_state(store: &StateStore) -> Result<NamespaceState, StateError> {
    let mut state = store.load()?;
    if matches!(state.phase, Phase::Creating | Phase::TearingDown) {
        warn!(
            "State file {} records an interrupted {}; treating it as FAILED",
            store.path().display(),
            state.phase
        );
        state.phase = Phase::Failed;
    }
    Ok(state)
}

/// Host mutations for one setup step, in order.
fn step_ops(step: SetupStep, spec: &NamespaceSpec) -> Vec<HostOp> {
    let ns = Some(spec.namespace.clone());
    match step {
        SetupStep::CreateNamespace => vec![HostOp::AddNamespace {
            name: spec.namespace.clone(),
        }],
        SetupStep::CreateVethPair => vec![
            HostOp::AddVethPair {
                host: spec.veth_host.clone(),
                peer: spec.veth_ns.clone(),
            },
            HostOp::MoveLink {
                link: spec.veth_ns.clone(),
                namespace: spec.namespace.clone(),
            },
        ],
        SetupStep::ConfigureVeth => {
            let mut ops = vec![
                HostOp::AddAddress {
                    namespace: None,
                    link: spec.veth_host.clone(),
                    address: spec.veth_host_ip,
                },
                HostOp::SetLinkUp {
                    namespace: None,
                    link: spec.veth_host.clone(),
                },
                HostOp::AddAddress {
                    namespace: ns.clone(),
                    link: spec.veth_ns.clone(),
                    address: spec.veth_ns_ip,
                },
                HostOp::SetLinkUp {
                    namespace: ns.clone(),
                    link: spec.veth_ns.clone(),
                },
                HostOp::SetLinkUp {
                    namespace: ns.clone(),
                    link: "lo".to_string(),
                },
                HostOp::AddRoute {
                    namespace: ns,
                    route: RouteSpec::default_via(spec.veth_host_ip.addr),
                },
                HostOp::EnableForwarding,
                HostOp::AddMasquerade {
                    source: spec.veth_subnet(),
                },
            ];
            if !spec.dns.is_empty() {
                ops.push(HostOp::WriteResolvConf {
                    namespace: spec.namespace.clone(),
                    servers: spec.dns.clone(),
                });
            }
            ops
        }
        SetupStep::CreateTun => vec![
            HostOp::AddTun {
                namespace: spec.namespace.clone(),
                link: spec.tun_interface.clone(),
            },
            HostOp::AddAddress {
                namespace: ns.clone(),
                link: spec.tun_interface.clone(),
                address: spec.tun_ip,
            },
            HostOp::SetLinkUp {
                namespace: ns,
                link: spec.tun_interface.clone(),
            },
        ],
        SetupStep::RouteThroughTun => vec![
            // The proxy itself must keep going out over the veth
            HostOp::AddRoute {
                namespace: ns.clone(),
                route: RouteSpec::via(spec.proxy_route(), spec.veth_host_ip.addr),
            },
            HostOp::AddRoute {
                namespace: ns.clone(),
                route: RouteSpec::dev("0.0.0.0/1", &spec.tun_interface),
            },
            HostOp::AddRoute {
                namespace: ns,
                route: RouteSpec::dev("128.0.0.0/1", &spec.tun_interface),
            },
        ],
        SetupStep::StartRelay => Vec::new(),
    }
}

/// The resource a teardown step removes and the operation that removes it.
fn cleanup_op(step: CleanupStep, spec: &NamespaceSpec) -> Option<(Resource, HostOp)> {
    let removal = match step {
        CleanupStep::StopRelay => return None,
        CleanupStep::RemoveTun => (
            Resource::Link {
                namespace: Some(spec.namespace.clone()),
                name: spec.tun_interface.clone(),
            },
            HostOp::DeleteLink {
                namespace: Some(spec.namespace.clone()),
                link: spec.tun_interface.clone(),
            },
        ),
        CleanupStep::RemoveVethHost => (
            Resource::Link {
                namespace: None,
                name: spec.veth_host.clone(),
            },
            HostOp::DeleteLink {
                namespace: None,
                link: spec.veth_host.clone(),
            },
        ),
        CleanupStep::RemoveNatRule => {
            let source: Ipv4Cidr = spec.veth_subnet();
            (
                Resource::NatRule { source },
                HostOp::DeleteMasquerade { source },
            )
        }
        CleanupStep::DeleteNamespace => (
            Resource::Namespace {
                name: spec.namespace.clone(),
            },
            HostOp::DeleteNamespace {
                name: spec.namespace.clone(),
            },
        ),
        CleanupStep::RemoveResolvConf => (
            Resource::ResolvConf {
                namespace: spec.namespace.clone(),
            },
            HostOp::RemoveResolvConf {
                namespace: spec.namespace.clone(),
            },
        ),
        CleanupStep::RestoreForwarding => (Resource::IpForwarding, HostOp::DisableForwarding),
    };
    Some(removal)
}
