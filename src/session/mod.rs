//! Session bridge: run commands in the namespace as the invoking user.
//!
//! A command started inside the namespace runs under a different network
//! stack and, usually, from a root-owned process. For a GUI application to
//! work it still needs the user's uid, home directory, display, audio server
//! and session bus. This module recovers those ([`EnvironmentReconstructor`])
//! and re-exposes them to the command ([`SessionBridge`]).
//!
//! Sockets stay at their host paths: entering a network namespace does not
//! change the mount namespace, so the paths only need to be passed through
//! the environment and be reachable by the target uid.

pub mod bridge;
pub mod builder;
pub mod environment;
pub mod error;

pub use bridge::{BridgeOptions, InheritStdio, SessionBridge, Spawner, exit_code};
pub use builder::{BridgeCommandBuilder, shell_quote};
pub use environment::{
    Account, AccountQuery, EnvironmentReconstructor, EnvironmentStore, SessionEnvironment,
};
pub use error::{ReconstructError, RunError};
