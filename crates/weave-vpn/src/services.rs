//! Hop Services
//!
//! The steps a pipeline runs on top of an established userspace stack:
//! connectivity check, exit proxy, UDP bridge and relay client.

use crate::bridge::{self, BridgeError};
use crate::config::RelayOptions;
use crate::device::NetStack;
use crate::proxy::{self, ProxyError};
use crate::relay::{CommandRelay, RelayError};
use crate::verify::{self, VerifyError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[async_trait]
pub trait HopServices: Send + Sync {
    /// Fail unless traffic actually flows through `stack`
    async fn verify_connectivity(
        &self,
        ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
    ) -> Result<(), VerifyError>;

    /// Serve a proxy on `bind` backed by `stack`; returns the bound address
    async fn start_local_proxy(
        &self,
        ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
        bind: SocketAddr,
    ) -> Result<SocketAddr, ProxyError>;

    /// Relay UDP from `local` to `remote` through `stack`; returns the bound address
    async fn start_bridge(
        &self,
        ctx: &CancellationToken,
        local: SocketAddr,
        remote: &str,
        stack: Arc<dyn NetStack>,
        mtu: u16,
    ) -> Result<SocketAddr, BridgeError>;

    /// Expose `listen` through the relay network, upstream via `upstream`
    async fn start_relay(
        &self,
        ctx: &CancellationToken,
        upstream: SocketAddr,
        listen: SocketAddr,
        country: &str,
    ) -> Result<(), RelayError>;
}

/// Services built from this crate's proxy, bridge, verifier and relay
///
/// Every long-lived task they start runs on the shared tracker.
#[derive(Debug, Clone)]
pub struct DefaultServices {
    verify_timeout: Duration,
    relay: Option<CommandRelay>,
    tracker: TaskTracker,
}

impl DefaultServices {
    pub fn new(verify_timeout: Duration, relay: Option<&RelayOptions>, tracker: TaskTracker) -> Self {
        Self {
            verify_timeout,
            relay: relay.map(CommandRelay::from_options),
            tracker,
        }
    }
}

#[async_trait]
impl HopServices for DefaultServices {
    async fn verify_connectivity(
        &self,
        ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
    ) -> Result<(), VerifyError> {
        tokio::select! {
            r = verify::verify_connectivity(stack.as_ref(), self.verify_timeout) => r,
            _ = ctx.cancelled() => Err(VerifyError::Http("cancelled".into())),
        }
    }

    async fn start_local_proxy(
        &self,
        ctx: &CancellationToken,
        stack: Arc<dyn NetStack>,
        bind: SocketAddr,
    ) -> Result<SocketAddr, ProxyError> {
        proxy::start_local_proxy(ctx.clone(), &self.tracker, stack, bind).await
    }

    async fn start_bridge(
        &self,
        ctx: &CancellationToken,
        local: SocketAddr,
        remote: &str,
        stack: Arc<dyn NetStack>,
        mtu: u16,
    ) -> Result<SocketAddr, BridgeError> {
        bridge::start_bridge(ctx.clone(), &self.tracker, local, remote, stack, mtu).await
    }

    async fn start_relay(
        &self,
        ctx: &CancellationToken,
        upstream: SocketAddr,
        listen: SocketAddr,
        country: &str,
    ) -> Result<(), RelayError> {
        match &self.relay {
            Some(relay) => relay.start(ctx.clone(), &self.tracker, upstream, listen, country).await,
            None => Err(RelayError::NotConfigured),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostStack;

    #[tokio::test]
    async fn test_relay_not_configured() {
        let services = DefaultServices::new(Duration::from_secs(1), None, TaskTracker::new());
        let result = services
            .start_relay(&CancellationToken::new(), "127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap(), "DE")
            .await;

        assert!(matches!(result, Err(RelayError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_proxy_runs_on_shared_tracker() {
        let tracker = TaskTracker::new();
        let services = DefaultServices::new(Duration::from_secs(1), None, tracker.clone());
        let ctx = CancellationToken::new();

        services
            .start_local_proxy(&ctx, Arc::new(HostStack), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(tracker.len(), 1);

        ctx.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
    }
}
