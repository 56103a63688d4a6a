//! Kernel WireGuard Backend
//!
//! Drives the Linux in-kernel WireGuard module through the `ip` and `wg`
//! tools. Only OS-level interfaces are available here; userspace stacks
//! come from [`crate::userspace::UserspaceBackend`].

use crate::device::{DeviceError, NetStack, TunnelBackend};
use crate::profile::{PeerConfig, TunnelConfig};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default interface name prefix
pub const DEFAULT_PREFIX: &str = "weave";

/// External program plus fixed leading arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    program: String,
    prefix: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Run `program` with `prefix` ahead of every argument list
    pub fn with_prefix<I, S>(program: impl Into<String>, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            prefix: prefix.into_iter().map(Into::into).collect(),
        }
    }
}

/// Kernel interface owned by a hop
///
/// Deleted on drop unless it was handed over to a running session.
#[derive(Debug)]
pub struct KernelInterface {
    name: String,
    armed: bool,
    ip: Tool,
    tracker: TaskTracker,
}

impl KernelInterface {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop owning the link; teardown is someone else's job now
    fn disarm(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.name)
    }
}

impl Drop for KernelInterface {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let name = std::mem::take(&mut self.name);
        let ip = self.ip.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(interface = %name, "no runtime left to delete interface");
            return;
        };

        debug!(interface = %name, "releasing unused interface");
        self.tracker.spawn_on(async move {
            if let Err(e) = run(&ip, &["link", "del", "dev", &name], None).await {
                warn!(interface = %name, "failed to delete interface: {}", e);
            }
        }, &handle);
    }
}

/// Backend over the kernel WireGuard module
#[derive(Debug)]
pub struct KernelBackend {
    prefix: String,
    next: AtomicU32,
    ip: Tool,
    wg: Tool,
    tracker: TaskTracker,
}

impl KernelBackend {
    /// Backend whose teardown tasks run on `tracker`
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            next: AtomicU32::new(0),
            ip: Tool::new("ip"),
            wg: Tool::new("wg"),
            tracker,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the `ip` and `wg` programs
    pub fn with_tools(mut self, ip: Tool, wg: Tool) -> Self {
        self.ip = ip;
        self.wg = wg;
        self
    }

    fn next_name(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl TunnelBackend for KernelBackend {
    type Device = KernelInterface;

    async fn create_os_interface(&self) -> Result<KernelInterface, DeviceError> {
        let name = self.next_name();
        run(&self.ip, &["link", "add", "dev", &name, "type", "wireguard"], None).await?;
        info!(interface = %name, "created WireGuard interface");

        Ok(KernelInterface {
            name,
            armed: true,
            ip: self.ip.clone(),
            tracker: self.tracker.clone(),
        })
    }

    async fn create_userspace_stack(
        &self,
        _config: &TunnelConfig,
    ) -> Result<(KernelInterface, Arc<dyn NetStack>), DeviceError> {
        Err(DeviceError::Unsupported("userspace stacks with the kernel backend"))
    }

    async fn establish(
        &self,
        ctx: &CancellationToken,
        config: &TunnelConfig,
        device: KernelInterface,
        fwmark: u32,
    ) -> Result<(), DeviceError> {
        let name = device.name().to_string();

        let key = config.interface.private_key.to_base64();
        run(&self.wg, &["set", &name, "private-key", "/dev/stdin"], Some(&key)).await?;

        if fwmark != 0 {
            run(&self.wg, &["set", &name, "fwmark", &fwmark.to_string()], None).await?;
        }

        for peer in &config.peers {
            if peer.trick {
                debug!(interface = %name, "traffic shaping not available in kernel mode");
            }
            let args = peer_args(&name, peer);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let psk = peer.preshared_key.as_ref().map(|k| k.to_base64());
            run(&self.wg, &args, psk.as_deref()).await?;
        }

        for addr in &config.interface.addresses {
            run(&self.ip, &["address", "add", &addr.to_string(), "dev", &name], None).await?;
        }

        let mtu = config.interface.mtu.to_string();
        run(&self.ip, &["link", "set", "dev", &name, "mtu", &mtu, "up"], None).await?;

        let name = device.disarm();
        info!(interface = %name, mtu = config.interface.mtu, peers = config.peers.len(), "interface up");

        let ctx = ctx.clone();
        let ip = self.ip.clone();
        self.tracker.spawn(async move {
            ctx.cancelled().await;
            match run(&ip, &["link", "del", "dev", &name], None).await {
                Ok(()) => info!(interface = %name, "interface removed"),
                Err(e) => warn!(interface = %name, "failed to remove interface: {}", e),
            }
        });

        Ok(())
    }

    fn device_name(&self, device: &KernelInterface) -> String {
        device.name().to_string()
    }
}

/// `wg set` arguments for one peer
fn peer_args(interface: &str, peer: &PeerConfig) -> Vec<String> {
    let mut args = vec![
        "set".to_string(),
        interface.to_string(),
        "peer".to_string(),
        peer.public_key.to_string(),
    ];

    if peer.preshared_key.is_some() {
        args.extend(["preshared-key".to_string(), "/dev/stdin".to_string()]);
    }

    let endpoint = peer.resolved.map(|a| a.to_string()).or_else(|| peer.endpoint.clone());
    if let Some(endpoint) = endpoint {
        args.extend(["endpoint".to_string(), endpoint]);
    }

    if !peer.allowed_ips.is_empty() {
        let ips: Vec<String> = peer.allowed_ips.iter().map(|c| c.to_string()).collect();
        args.extend(["allowed-ips".to_string(), ips.join(",")]);
    }

    if peer.keepalive > 0 {
        args.extend(["persistent-keepalive".to_string(), peer.keepalive.to_string()]);
    }

    args
}

/// Run a tool, optionally feeding `input` on stdin
async fn run(tool: &Tool, args: &[&str], input: Option<&str>) -> Result<(), DeviceError> {
    let command_line = format!("{} {}", tool.program, args.join(" "));
    debug!(command = %command_line, "running");

    let mut child = Command::new(&tool.program)
        .args(&tool.prefix)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(command_line.clone()),
            _ => DeviceError::Command(command_line.clone(), e.to_string()),
        })?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await
            .map_err(|e| DeviceError::Command(command_line.clone(), e.to_string()))?;
    }

    let output = child.wait_with_output().await
        .map_err(|e| DeviceError::Command(command_line.clone(), e.to_string()))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Operation not permitted") {
        return Err(DeviceError::PermissionDenied(command_line));
    }
    Err(DeviceError::Command(command_line, stderr))
}
