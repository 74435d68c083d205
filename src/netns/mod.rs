//! Proxied network namespace lifecycle.
//!
//! Builds a named network namespace whose egress is forced through a
//! TUN-to-proxy relay, and tears it down again.
//!
//! # Topology
//!
//! ```text
//! ┌──────────────── host ────────────────┐   ┌──────────── namespace ────────────┐
//! │                                      │   │                                   │
//! │  eth0 ◄── MASQUERADE 10.0.0.0/30     │   │  app ──► 0.0.0.0/1, 128.0.0.0/1   │
//! │                ▲                     │   │              │                    │
//! │                │                     │   │              ▼                    │
//! │        vh0 10.0.0.1/30 ◄─────────────┼───┼── vn0 10.0.0.2/30    tun0         │
//! │                                      │   │     ▲                  │          │
//! │                                      │   │     │ proxy/32         ▼          │
//! │                                      │   │     └───────────── tun2socks      │
//! └──────────────────────────────────────┘   └───────────────────────────────────┘
//! ```
//!
//! Everything the application sends leaves through `tun0`; the relay turns
//! those packets into proxy connections, which are the only traffic routed
//! out over the veth pair.
//!
//! # Components
//!
//! - [`NamespaceSpec`]: validated description of what to build
//! - [`HostOp`] / [`NetworkHost`]: typed host mutations and who performs them
//! - [`IpCommandHost`]: iproute2/iptables backend
//! - [`MemoryHost`]: simulated backend for dry runs and tests
//! - [`NamespaceOrchestrator`]: the phase machine with rollback

pub mod error;
pub mod host;
pub mod memory;
pub mod orchestrator;
pub mod relay;
pub mod spec;
pub mod state;

pub use error::{
    CleanupError, CleanupFailure, HostError, ReadyError, SetupError, StateError, ValidationError,
};
pub use host::{HostOp, IpCommandHost, NetworkHost, RouteSpec};
pub use memory::{HostSnapshot, MemoryHost};
pub use orchestrator::{NamespaceOrchestrator, OrchestratorOptions, ReadyGuard};
pub use relay::{RelayCommand, RelayOptions, StopOutcome};
pub use spec::{Ipv4Cidr, NamespaceSpec, ProxyScheme, ProxyUrl};
pub use state::{
    CleanupStep, NamespaceState, Phase, RelayHandle, Resource, SetupStep, StateStore,
};
