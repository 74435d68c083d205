//! Audit event types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for the namespace lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Namespace reached READY.
    NamespaceSetup {
        /// Namespace name.
        namespace: String,
        /// Relay PID.
        relay_pid: u32,
        /// Proxy endpoint, without credentials.
        proxy: String,
    },

    /// Setup aborted.
    SetupFailed {
        /// Namespace name.
        namespace: String,
        /// Step that failed, if setup got that far.
        step: Option<String>,
        /// Phase after rollback.
        phase: String,
        /// Error message.
        error: String,
    },

    /// Namespace removed.
    NamespaceCleanup {
        /// Namespace name.
        namespace: String,
        /// Relay PID that was stopped.
        relay_pid: Option<u32>,
    },

    /// Teardown left resources behind.
    CleanupFailed {
        /// Namespace name.
        namespace: String,
        /// One entry per failed step.
        failures: Vec<String>,
    },

    /// A command ran inside the namespace.
    CommandRun {
        /// Namespace name.
        namespace: String,
        /// User the command ran as.
        user: String,
        /// That user's uid.
        uid: u32,
        /// Command (empty for an interactive shell).
        command: String,
        /// Exit code.
        exit_code: i32,
    },

    /// The invoking user's session environment was rebuilt.
    EnvironmentReconstructed {
        /// User name.
        user: String,
        /// User id.
        uid: u32,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event, flattened into this struct.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
