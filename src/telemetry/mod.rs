//! Audit logging for proxyns.
//!
//! Lifecycle events (namespace setup and teardown, commands run inside the
//! namespace) go to syslog with the `PROXYNS` tag as one JSON object per line.
//!
//! - **Audit logging** (syslog): what was done to the host and by whom
//! - **Debug logging** (tracing): diagnostics on stderr, controlled by `-v`
//!
//! # Usage
//!
//! ```ignore
//! use proxyns::telemetry::{self, AuditEvent};
//!
//! telemetry::init_logger()?;
//!
//! telemetry::record(AuditEvent::NamespaceCleanup {
//!     namespace: "nsA".to_string(),
//!     relay_pid: Some(4242),
//! });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-10-19T14:32:01Z","event":"namespace_setup","namespace":"nsA","relay_pid":4242,"socks_url":"socks5://203.0.113.5:1080"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG, init_logger, init_null_logger, record, try_audit};
