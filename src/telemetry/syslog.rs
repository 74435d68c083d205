//! Syslog integration for audit logging.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "PROXYNS";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes JSON events to syslog.
pub struct AuditLogger {
    /// None indicates a null logger.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon over its Unix socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a logger that discards all events.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event.
    ///
    /// Write failures are reported through `tracing` and otherwise ignored.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            return;
        };

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Err(e) => error!("Failed to acquire syslog writer lock: {}", e),
        }
        debug!("Logged audit event: {}", json);
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger.
///
/// Falls back to a null logger when syslog is unreachable (containers,
/// minimal systems); the connection error is returned only for reporting.
pub fn init_logger() -> Result<(), TelemetryError> {
    let (logger, result) = match AuditLogger::new() {
        Ok(logger) => (logger, Ok(())),
        Err(e) => (AuditLogger::new_null(), Err(e)),
    };

    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    result
}

/// Install a null global logger (tests, dry runs).
pub fn init_null_logger() {
    let _ = AUDIT_LOGGER.set(AuditLogger::new_null());
}

/// Get the global audit logger, if initialized.
pub fn try_audit() -> Option<&'static AuditLogger> {
    AUDIT_LOGGER.get()
}

/// Log an event to the global audit logger; a no-op before initialization.
pub fn record(event: AuditEvent) {
    if let Some(logger) = try_audit() {
        logger.log(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "PROXYNS");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::EnvironmentReconstructed {
            user: "alice".to_string(),
            uid: 1000,
        });
    }

    #[test]
    fn test_record_without_logger_is_noop() {
        record(AuditEvent::NamespaceCleanup {
            namespace: "nsA".to_string(),
            relay_pid: None,
        });
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_log_event() {
        let logger = AuditLogger::new().unwrap();
        logger.log(AuditEvent::NamespaceCleanup {
            namespace: "nsA".to_string(),
            relay_pid: Some(1),
        });
    }
}
