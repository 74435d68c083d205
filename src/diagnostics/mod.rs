//! Reachability probes for the proxy endpoint.
//!
//! Both probes are async and bounded by the probe timeout. They report what
//! the network did as a value; only malformed input is an error.

mod error;
mod probe;

pub use error::DiagnosticsError;
pub use probe::{DEFAULT_PROBE_TIMEOUT, DiagnosticsProbe, PingResult, PortStatus};
