//! Test doubles shared by the module tests

use crate::bridge::BridgeError;
use crate::config::ScanOptions;
use crate::device::{BoxedStream, DatagramFlow, DeviceError, NetStack, TunnelBackend};
use crate::endpoint::{EndpointScanner, ScanError, ScanResult};
use crate::identity::{IdentityError, IdentityProvisioner};
use crate::profile::{ProfileError, TunnelConfig};
use crate::proxy::ProxyError;
use crate::relay::RelayError;
use crate::services::HopServices;
use crate::session::SessionSource;
use crate::verify::VerifyError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Stack that dials straight out of the host network
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStack;

#[async_trait]
impl NetStack for HostStack {
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>> {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(Box::new(HostFlow(socket)))
    }

    fn label(&self) -> String {
        "host".to_string()
    }
}

struct HostFlow(UdpSocket);

#[async_trait]
impl DatagramFlow for HostFlow {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf).await
    }
}

/// Observable collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Provision(PathBuf),
    Scan,
    Build { profile: PathBuf, endpoint: String },
    CreateOsInterface,
    CreateStack { stack: String, mtu: u16, keepalive: u16, trick: bool },
    Establish { device: String, endpoint: Option<SocketAddr>, fwmark: u32 },
    Verify { stack: String },
    Bridge { stack: String, remote: String, mtu: u16 },
    Proxy { stack: String, bind: SocketAddr },
    Relay { upstream: SocketAddr, listen: SocketAddr, country: String },
}

/// Ordered log of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Step>>>);

impl Recorder {
    pub fn record(&self, step: Step) {
        self.0.lock().unwrap().push(step);
    }

    pub fn steps(&self) -> Vec<Step> {
        self.0.lock().unwrap().clone()
    }
}

/// Stack handed out by [`FakeBackend`]; never carries traffic
pub struct FakeStack(pub String);

#[async_trait]
impl NetStack for FakeStack {
    async fn dial_tcp(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "fake stack"))
    }

    async fn dial_udp(&self, _addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "fake stack"))
    }

    fn label(&self) -> String {
        self.0.clone()
    }
}

/// Backend that records calls and hands out numbered devices
#[derive(Default)]
pub struct FakeBackend {
    pub recorder: Recorder,
    devices: AtomicUsize,
    establishes: AtomicUsize,
    /// Fail the establish call with this zero-based index
    pub fail_establish: Option<usize>,
    pub fail_os_interface: bool,
}

impl FakeBackend {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            ..Default::default()
        }
    }

    fn next_device(&self) -> String {
        format!("dev{}", self.devices.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl TunnelBackend for FakeBackend {
    type Device = String;

    async fn create_os_interface(&self) -> Result<String, DeviceError> {
        self.recorder.record(Step::CreateOsInterface);
        if self.fail_os_interface {
            return Err(DeviceError::PermissionDenied("fake".into()));
        }
        Ok(format!("tun-{}", self.next_device()))
    }

    async fn create_userspace_stack(
        &self,
        config: &TunnelConfig,
    ) -> Result<(String, Arc<dyn NetStack>), DeviceError> {
        let device = self.next_device();
        let stack = format!("stack-{}", device);
        let peer = &config.peers[0];
        self.recorder.record(Step::CreateStack {
            stack: stack.clone(),
            mtu: config.interface.mtu,
            keepalive: peer.keepalive,
            trick: peer.trick,
        });
        Ok((device, Arc::new(FakeStack(stack))))
    }

    async fn establish(
        &self,
        _ctx: &CancellationToken,
        config: &TunnelConfig,
        device: String,
        fwmark: u32,
    ) -> Result<(), DeviceError> {
        let index = self.establishes.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(Step::Establish {
            device,
            endpoint: config.peers[0].resolved,
            fwmark,
        });
        if self.fail_establish == Some(index) {
            return Err(DeviceError::InvalidConfig("fake".into()));
        }
        Ok(())
    }

    fn device_name(&self, device: &String) -> String {
        device.clone()
    }
}

/// Session source that records loads and serves a fixed profile
pub struct FakeSessions {
    pub recorder: Recorder,
    pub profile: String,
}

#[async_trait]
impl SessionSource for FakeSessions {
    async fn load(&self, profile: &Path, endpoint: &str) -> Result<TunnelConfig, ProfileError> {
        self.recorder.record(Step::Build {
            profile: profile.to_path_buf(),
            endpoint: endpoint.to_string(),
        });
        TunnelConfig::parse(&self.profile)?
            .with_endpoint(endpoint).await
    }
}

/// Provisioner that only records
#[derive(Default)]
pub struct FakeIdentities {
    pub recorder: Recorder,
    /// Fail when provisioning a directory ending in this name
    pub fail_slot: Option<&'static str>,
}

#[async_trait]
impl IdentityProvisioner for FakeIdentities {
    async fn provision(&self, dir: &Path, _license: &str) -> Result<(), IdentityError> {
        self.recorder.record(Step::Provision(dir.to_path_buf()));
        if let Some(slot) = self.fail_slot {
            if dir.ends_with(slot) {
                return Err(IdentityError::Other("fake".into()));
            }
        }
        Ok(())
    }
}

/// Scanner returning fixed results
pub struct FakeScanner {
    pub recorder: Recorder,
    pub results: Result<Vec<ScanResult>, ScanError>,
}

#[async_trait]
impl EndpointScanner for FakeScanner {
    async fn scan(&self, _ctx: &CancellationToken, _opts: &ScanOptions) -> Result<Vec<ScanResult>, ScanError> {
        self.recorder.record(Step::Scan);
        self.results.clone()
    }
}

/// Address returned by [`FakeServices::start_bridge`]
pub const BRIDGE_ADDR: &str = "127.0.0.1:40000";

/// Address returned by [`FakeServices::start_local_proxy`] for port 0
pub const EPHEMERAL_PROXY_ADDR: &str = "127.0.0.1:41000";

/// Services that record calls
#[derive(Default)]
pub struct FakeServices {
    pub recorder: Recorder,
    /// Fail verification of the stack with this label
    pub fail_verify: Option<String>,
    pub fail_relay: bool,
}

impl FakeServices {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            ..Default::default()
        }
    }
}

#[async_trait]
impl HopServices for FakeServices {
    async fn verify_connectivity(
        &self,
        _ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
    ) -> Result<(), VerifyError> {
        let label = stack.label();
        self.recorder.record(Step::Verify { stack: label.clone() });
        if self.fail_verify.as_deref() == Some(label.as_str()) {
            return Err(VerifyError::Http("fake".into()));
        }
        Ok(())
    }

    async fn start_local_proxy(
        &self,
        _ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
        bind: SocketAddr,
    ) -> Result<SocketAddr, ProxyError> {
        self.recorder.record(Step::Proxy { stack: stack.label(), bind });
        if bind.port() == 0 {
            return Ok(EPHEMERAL_PROXY_ADDR.parse().unwrap());
        }
        Ok(bind)
    }

    async fn start_bridge(
        &self,
        _ctx: &CancellationToken,
        _local: SocketAddr,
        remote: &str,
        stack: Arc<dyn NetStack>,
        mtu: u16,
    ) -> Result<SocketAddr, BridgeError> {
        self.recorder.record(Step::Bridge {
            stack: stack.label(),
            remote: remote.to_string(),
            mtu,
        });
        Ok(BRIDGE_ADDR.parse().unwrap())
    }

    async fn start_relay(
        &self,
        _ctx: &CancellationToken,
        upstream: SocketAddr,
        listen: SocketAddr,
        country: &str,
    ) -> Result<(), RelayError> {
        self.recorder.record(Step::Relay {
            upstream,
            listen,
            country: country.to_string(),
        });
        if self.fail_relay {
            return Err(RelayError::Exited("exit status: 1".into()));
        }
        Ok(())
    }
}
