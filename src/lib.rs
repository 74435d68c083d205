//! proxyns: proxied network namespaces for desktop applications
//!
//! This crate builds a network namespace whose only way out is a SOCKS (or
//! HTTP, Shadowsocks, ...) proxy, and runs programs inside it as the invoking
//! user with their display, audio and session bus intact.
//!
//! # Security Model
//!
//! Traffic is forced through the proxy by routing, not by application
//! settings: inside the namespace every non-local destination is routed to a
//! TUN device served by the relay, and only the proxy endpoint itself is
//! routed out over the veth pair. Setup is all-or-nothing; a failed step
//! rolls back what was built.
//!
//! # Architecture
//!
//! - **Netns**: namespace, veth, TUN and relay lifecycle with rollback
//! - **Session**: recovers the user's session and runs commands inside the namespace
//! - **Diagnostics**: ping and TCP port probes
//! - **Deps**: host prerequisite checks
//! - **Config**: hierarchical flat TOML configuration
//! - **Telemetry**: structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod deps;
pub mod diagnostics;
pub mod netns;
mod persist;
pub mod session;
pub mod telemetry;
