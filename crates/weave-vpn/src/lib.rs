//! Weave VPN - Tunnel Composition over WireGuard
//!
//! Builds one of three tunnel topologies from a single configuration and
//! exposes it as a local SOCKS5 proxy, a relay listener or an OS-level
//! interface.
//!
//! # Architecture
//!
//! ```text
//! Normal:
//!   client ──▶ SOCKS5 (bind) ──▶ [hop: outer tuning] ──UDP──▶ endpoint
//!
//! Double hop:
//!   client ──▶ SOCKS5 (bind) ──▶ [inner hop] ──UDP──▶ bridge (127.0.0.1)
//!                                                        │
//!                          endpoint ◀──UDP── [outer hop] ◀┘
//!
//! Relay:
//!   client ──▶ relay client (bind) ──▶ SOCKS5 (127.0.0.1:0) ──▶ [hop] ──▶ endpoint
//! ```
//!
//! # Run sequence
//!
//! 1. Validate the mode; conflicting options fail before anything is touched
//! 2. Provision the primary and secondary identity slots
//! 3. Select endpoints, by scanning or from the configured endpoint
//! 4. Per hop: build session → create device → establish → verify
//! 5. Start the exit surface
//!
//! Every long-lived task started along the way runs on one shared
//! `TaskTracker` and stops when the run's cancellation token is cancelled;
//! [`Orchestrator::shutdown`] cancels and then waits for all of them.

mod bridge;
mod config;
mod device;
mod dns;
mod endpoint;
mod identity;
mod kernel;
mod keys;
mod mode;
mod orchestrator;
mod profile;
mod proxy;
mod relay;
mod services;
mod session;
mod system;
mod userspace;
mod verify;

#[cfg(test)]
mod testing;

pub use bridge::{start_bridge, BridgeError};
pub use config::{
    ConfigError, PeerTemplate, RelayOptions, RunOptions, ScanOptions, TunOptions,
    DEFAULT_ENDPOINT,
};
pub use device::{
    BoxedStream, DatagramFlow, DeviceError, NetStack, TunnelBackend, TunnelStream,
};
pub use endpoint::{select_endpoints, EndpointScanner, ResolveScanner, ScanError, ScanResult};
pub use identity::{
    FileIdentityStore, IdentityError, IdentityProvisioner, IdentityRecord, IdentitySlot,
};
pub use kernel::{KernelBackend, KernelInterface, Tool};
pub use keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
pub use mode::Mode;
pub use orchestrator::{Hop, Orchestrator, RunError, RunState, Serving};
pub use profile::{Cidr, InterfaceConfig, PeerConfig, ProfileError, TunnelConfig};
pub use proxy::{start_local_proxy, ProxyConfig, ProxyError, Socks5Proxy};
pub use relay::{CommandRelay, RelayError};
pub use services::{DefaultServices, HopServices};
pub use session::{build_session, ProfileFiles, SessionSource, Tuning, INNER_MTU, OUTER_MTU};
pub use system::{SystemBackend, SystemDevice};
pub use userspace::{UserspaceBackend, UserspaceDevice, UserspaceStack};
pub use verify::{verify_connectivity, VerifyError, PROBE_URL};
