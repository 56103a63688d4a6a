//! System Backend
//!
//! Pairs the kernel backend (OS-level interfaces) with the userspace
//! backend (in-process stacks) so every mode works from one binary,
//! including a userspace outer hop under a kernel inner hop.

use crate::device::{DeviceError, NetStack, TunnelBackend};
use crate::kernel::{KernelBackend, KernelInterface};
use crate::profile::TunnelConfig;
use crate::userspace::{UserspaceBackend, UserspaceDevice};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Device from either half of a [`SystemBackend`]
#[derive(Debug)]
pub enum SystemDevice {
    Interface(KernelInterface),
    Stack(UserspaceDevice),
}

/// Kernel interfaces plus userspace stacks
#[derive(Debug)]
pub struct SystemBackend {
    kernel: KernelBackend,
    userspace: UserspaceBackend,
}

impl SystemBackend {
    /// Both halves run their background tasks on `tracker`
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            kernel: KernelBackend::new(tracker.clone()),
            userspace: UserspaceBackend::new(tracker),
        }
    }

    pub fn with_kernel(mut self, kernel: KernelBackend) -> Self {
        self.kernel = kernel;
        self
    }
}

#[async_trait]
impl TunnelBackend for SystemBackend {
    type Device = SystemDevice;

    async fn create_os_interface(&self) -> Result<SystemDevice, DeviceError> {
        self.kernel.create_os_interface().await.map(SystemDevice::Interface)
    }

    async fn create_userspace_stack(
        &self,
        config: &TunnelConfig,
    ) -> Result<(SystemDevice, Arc<dyn NetStack>), DeviceError> {
        let (device, stack) = self.userspace.create_userspace_stack(config).await?;
        Ok((SystemDevice::Stack(device), stack))
    }

    async fn establish(
        &self,
        ctx: &CancellationToken,
        config: &TunnelConfig,
        device: SystemDevice,
        fwmark: u32,
    ) -> Result<(), DeviceError> {
        match device {
            SystemDevice::Interface(device) => self.kernel.establish(ctx, config, device, fwmark).await,
            SystemDevice::Stack(device) => self.userspace.establish(ctx, config, device, fwmark).await,
        }
    }

    fn device_name(&self, device: &SystemDevice) -> String {
        match device {
            SystemDevice::Interface(device) => self.kernel.device_name(device),
            SystemDevice::Stack(device) => self.userspace.device_name(device),
        }
    }
}
