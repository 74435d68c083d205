//! Configuration system for proxyns.
//!
//! Configuration is a flat table of string values. Everything else
//! ([`NamespaceSpec`](crate::netns::NamespaceSpec), the command to run, relay
//! options, timeouts) is a projection of it.
//!
//! # Configuration Hierarchy
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/proxyns/config.toml`
//! 3. User config: `~/.config/proxyns/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. `--set key=value` flags (highest priority)
//!
//! # Example
//!
//! ```toml
//! ip = "203.0.113.5"
//! port = 1080
//! socks_url = "socks5://203.0.113.5:1080"
//! namespace = "proxied"
//! cmd = "firefox"
//! dns = "1.1.1.1, 9.9.9.9"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{ConfigStore, DEFAULT_STATE_DIR, OPTIONAL_KEYS, REQUIRED_KEYS};
