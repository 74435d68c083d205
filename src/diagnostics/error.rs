//! Diagnostics error types.

use thiserror::Error;

/// A probe could not be attempted.
///
/// Network failures are results, not errors; these cover bad input and a
/// missing `ping` tool.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    /// The host is not a hostname or IP literal.
    #[error("Invalid host '{host}': {reason}")]
    InvalidHost {
        /// Host as given.
        host: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The hostname does not resolve.
    #[error("Cannot resolve '{host}': {source}")]
    Resolve {
        /// Host as given.
        host: String,
        /// The underlying resolver error.
        #[source]
        source: std::io::Error,
    },

    /// The system `ping` could not be run.
    #[error("Failed to run ping: {0}")]
    PingUnavailable(#[source] std::io::Error),
}
