//! Error types for namespace lifecycle operations.
//!
//! - [`ValidationError`]: a spec field is missing or malformed (nothing touched)
//! - [`HostError`]: a single host command or process operation failed
//! - [`SetupError`]: setup aborted, carrying the failed step and rollback outcome
//! - [`CleanupError`]: best-effort teardown collected one or more failures
//! - [`ReadyError`]: a caller needed a READY namespace and did not get one
//! - [`StateError`]: the persisted state file could not be read or written

use super::state::{CleanupStep, Phase, Resource, SetupStep};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A spec value is missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value for {field}: {message}")]
pub struct ValidationError {
    /// Configuration key or spec field that failed validation.
    pub field: String,
    /// Why the value was rejected.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A host operation failed.
#[derive(Debug, Error)]
pub enum HostError {
    /// The command could not be executed at all.
    #[error("Failed to execute '{cmd}': {source}")]
    CommandFailed {
        /// Command line that was attempted.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited unsuccessfully.
    #[error("Command '{cmd}' failed: {stderr}")]
    CommandError {
        /// Command line that failed.
        cmd: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// A file the host operation needed could not be written or removed.
    #[error("Failed to update {path}: {source}")]
    FileError {
        /// Path that could not be updated.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The relay could not be spawned.
    #[error("Failed to spawn relay '{program}': {source}")]
    SpawnFailed {
        /// Relay program.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The relay exited before setup completed.
    #[error("Relay process {pid} exited during startup")]
    RelayExited {
        /// PID the relay had.
        pid: u32,
    },

    /// The process does not exist.
    #[error("No such process: {pid}")]
    NoSuchProcess {
        /// PID that was signalled.
        pid: u32,
    },

    /// Sending a signal failed for a reason other than the process being gone.
    #[error("Failed to signal process {pid}: {source}")]
    SignalFailed {
        /// PID that was signalled.
        pid: u32,
        /// The errno returned by kill(2).
        #[source]
        source: nix::Error,
    },

    /// The process survived SIGKILL.
    #[error("Process {pid} is still running after SIGKILL")]
    ProcessSurvived {
        /// PID that would not exit.
        pid: u32,
    },

    /// The in-memory host refused the operation.
    #[error("Simulated failure: {0}")]
    Simulated(String),
}

/// Namespace setup failed.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The spec failed validation; nothing was touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Setup is not allowed in the current phase.
    #[error("Cannot set up a namespace while phase is {phase}; run cleanup first")]
    InvalidPhase {
        /// Phase at the time of the call.
        phase: Phase,
    },

    /// A namespace is already READY with a different spec.
    #[error("Namespace '{namespace}' is already READY with a different configuration")]
    Conflict {
        /// Namespace that is currently live.
        namespace: String,
    },

    /// A resource with a requested name already exists.
    #[error("{resource} already exists on the host")]
    AlreadyExists {
        /// The conflicting resource.
        resource: Resource,
    },

    /// A step failed and every completed step was rolled back.
    #[error("Setup failed at step {step} (phase {phase}): {source}; completed steps were rolled back")]
    StepFailed {
        /// Step that failed.
        step: SetupStep,
        /// Phase after rollback.
        phase: Phase,
        /// Why the step failed.
        #[source]
        source: HostError,
    },

    /// A step failed and rollback left resources behind.
    #[error(
        "Setup failed at step {step} (phase {phase}): {source}; rollback left {}",
        list_resources(.residual)
    )]
    RollbackIncomplete {
        /// Step that failed.
        step: SetupStep,
        /// Phase after the attempted rollback.
        phase: Phase,
        /// Why the step failed.
        #[source]
        source: HostError,
        /// Resources still present on the host.
        residual: Vec<Resource>,
    },

    /// The state file could not be written.
    #[error("Failed to persist namespace state: {0}")]
    State(#[from] StateError),
}

impl SetupError {
    /// Step at which setup failed, if it got that far.
    pub fn step(&self) -> Option<SetupStep> {
        match self {
            SetupError::StepFailed { step, .. } | SetupError::RollbackIncomplete { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }
}

/// One teardown step that did not succeed.
#[derive(Debug)]
pub struct CleanupFailure {
    /// Step that failed.
    pub step: CleanupStep,
    /// Resource that is still present.
    pub resource: Resource,
    /// Why the step failed.
    pub error: HostError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.step, self.resource, self.error)
    }
}

/// Namespace cleanup failed.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// Cleanup is not allowed in the current phase.
    #[error("Cannot clean up while phase is {phase}")]
    InvalidPhase {
        /// Phase at the time of the call.
        phase: Phase,
    },

    /// The caller named a different namespace than the live one.
    #[error("Namespace '{requested}' is not managed here (active namespace is '{expected}')")]
    NamespaceMismatch {
        /// Namespace recorded in the state.
        expected: String,
        /// Namespace the caller asked for.
        requested: String,
    },

    /// The relay handle does not match the recorded relay.
    #[error("Relay handle PID {given} does not match the recorded relay PID {expected}")]
    RelayMismatch {
        /// PID recorded in the state.
        expected: u32,
        /// PID the caller supplied.
        given: u32,
    },

    /// One or more teardown steps failed; phase remains FAILED.
    #[error("Cleanup incomplete (phase {phase}): {}", list_failures(.failures))]
    Incomplete {
        /// Phase after cleanup.
        phase: Phase,
        /// Every step that failed.
        failures: Vec<CleanupFailure>,
    },

    /// The state file could not be updated.
    #[error("Failed to persist namespace state: {0}")]
    State(#[from] StateError),
}

/// The namespace is not available for running commands.
#[derive(Debug, Error)]
pub enum ReadyError {
    /// The namespace is not READY.
    #[error("Namespace is not ready (phase {phase})")]
    NotReady {
        /// Current phase.
        phase: Phase,
    },

    /// The caller named a different namespace than the live one.
    #[error("Namespace '{requested}' is not the active namespace '{expected}'")]
    NamespaceMismatch {
        /// Namespace recorded in the state.
        expected: String,
        /// Namespace the caller asked for.
        requested: String,
    },

    /// The recorded state could not be locked or read.
    #[error("Failed to read namespace state: {0}")]
    State(#[from] StateError),
}

/// Reading or writing the persisted state failed.
#[derive(Debug, Error)]
pub enum StateError {
    /// I/O on the state file failed.
    #[error("State file {path}: {source}")]
    Io {
        /// State file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state file is not valid JSON for the current format.
    #[error("Failed to parse state file {path}: {source}")]
    Parse {
        /// State file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The lock file could not be locked.
    #[error("Failed to lock {path}: {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// The errno returned by flock(2).
        #[source]
        source: nix::Error,
    },
}

fn list_resources(resources: &[Resource]) -> String {
    resources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("tun_ip", "not an address");
        assert_eq!(err.to_string(), "Invalid value for tun_ip: not an address");
    }

    #[test]
    fn test_step_failed_names_step_and_phase() {
        let err = SetupError::StepFailed {
            step: SetupStep::CreateTun,
            phase: Phase::Failed,
            source: HostError::CommandError {
                cmd: "ip -n nsA tuntap add dev tun0 mode tun".to_string(),
                stderr: "ioctl(TUNSETIFF): Device or resource busy".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("step 4"));
        assert!(msg.contains("FAILED"));
        assert_eq!(err.step(), Some(SetupStep::CreateTun));
    }

    #[test]
    fn test_rollback_incomplete_lists_residue() {
        let err = SetupError::RollbackIncomplete {
            step: SetupStep::StartRelay,
            phase: Phase::Failed,
            source: HostError::RelayExited { pid: 42 },
            residual: vec![
                Resource::Namespace {
                    name: "nsA".to_string(),
                },
                Resource::Link {
                    namespace: None,
                    name: "vh0".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("namespace nsA"));
        assert!(msg.contains("link vh0"));
    }

    #[test]
    fn test_cleanup_incomplete_lists_every_failure() {
        let err = CleanupError::Incomplete {
            phase: Phase::Failed,
            failures: vec![
                CleanupFailure {
                    step: CleanupStep::StopRelay,
                    resource: Resource::Relay { pid: 7 },
                    error: HostError::ProcessSurvived { pid: 7 },
                },
                CleanupFailure {
                    step: CleanupStep::DeleteNamespace,
                    resource: Resource::Namespace {
                        name: "nsA".to_string(),
                    },
                    error: HostError::Simulated("busy".to_string()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("relay process 7"));
        assert!(msg.contains("namespace nsA"));
    }
}
