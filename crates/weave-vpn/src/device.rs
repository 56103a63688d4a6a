//! Devices, Stacks and Tunnel Establishment
//!
//! The WireGuard engine and the userspace TCP/IP stack live behind these
//! traits. A hop asks its [`TunnelBackend`] for either an OS-level
//! interface or a userspace device plus [`NetStack`], then hands the
//! device over to `establish`. A device dropped before that point is
//! released by its own `Drop`.

use crate::profile::TunnelConfig;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Byte stream dialled through a stack
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Connected UDP flow dialled through a stack
#[async_trait]
pub trait DatagramFlow: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// In-process network stack sitting on a tunnel
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Open a TCP stream to `host:port`; the stack resolves names itself
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<BoxedStream>;

    /// Open a UDP flow to `addr`
    async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>>;

    /// Short label for logs
    fn label(&self) -> String {
        "netstack".to_string()
    }
}

/// Device factory and WireGuard engine
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Device handle owned by a hop until it is established
    type Device: Send;

    /// Create an OS-level virtual interface
    async fn create_os_interface(&self) -> Result<Self::Device, DeviceError>;

    /// Create a userspace device and the stack on top of it
    async fn create_userspace_stack(
        &self,
        config: &TunnelConfig,
    ) -> Result<(Self::Device, Arc<dyn NetStack>), DeviceError>;

    /// Bring up `config` on `device`
    ///
    /// Returns once the session is scheduled. An unreachable peer is not
    /// an error here. The engine owns the device afterwards and tears it
    /// down when `ctx` is cancelled. `fwmark` is 0 for userspace devices.
    async fn establish(
        &self,
        ctx: &CancellationToken,
        config: &TunnelConfig,
        device: Self::Device,
        fwmark: u32,
    ) -> Result<(), DeviceError>;

    /// Human-readable device name for logs
    fn device_name(&self, device: &Self::Device) -> String;
}

/// Device and establishment errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("command `{0}` failed: {1}")]
    Command(String, String),

    #[error("device error: {0}")]
    Other(String),
}
