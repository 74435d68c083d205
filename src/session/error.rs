//! Error types for the session bridge.

use crate::netns::ReadyError;
use std::path::PathBuf;
use thiserror::Error;

/// The bridge could not establish the execution context.
///
/// The target command's own exit status is never a `RunError`.
#[derive(Debug, Error)]
pub enum RunError {
    /// The namespace is not READY (or is a different one); nothing was launched.
    #[error(transparent)]
    NotReady(#[from] ReadyError),

    /// The state says READY but the namespace is gone from the host.
    #[error("Namespace '{namespace}' does not exist on the host; run cleanup and setup again")]
    NamespaceMissing {
        /// Namespace name.
        namespace: String,
    },

    /// Switching to the target user is impossible.
    #[error("Cannot run as {user}: {reason}")]
    PrivilegeDrop {
        /// User the command should run as.
        user: String,
        /// Why it cannot.
        reason: String,
    },

    /// A session resource path is missing or unreadable.
    #[error("{resource} at {path} is not accessible: {source}")]
    ResourceUnavailable {
        /// What the path is for.
        resource: &'static str,
        /// The path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command could not be started.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        /// First word of the command line.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// The invoking user's session could not be reconstructed or loaded.
#[derive(Debug, Error)]
pub enum ReconstructError {
    /// Who invoked us, or where their home is, cannot be determined.
    #[error("Cannot determine the invoking user: {0}")]
    IdentityUnavailable(String),

    /// No environment has been saved yet.
    #[error("No saved session environment at {path}; run 'proxyns env --refresh'")]
    NotFound {
        /// Expected side file.
        path: PathBuf,
    },

    /// The side file could not be read or written.
    #[error("Session environment file {path}: {source}")]
    Io {
        /// Side file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The side file is not valid JSON.
    #[error("Failed to parse session environment {path}: {source}")]
    Parse {
        /// Side file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}
