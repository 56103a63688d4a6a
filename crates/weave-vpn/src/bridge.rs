//! UDP Bridge
//!
//! Forwards datagrams between a loopback socket and a remote endpoint
//! through a hop's userspace stack. Giving the inner hop the loopback
//! address as its endpoint makes every inner packet travel inside the
//! outer tunnel.

use crate::device::{DatagramFlow, NetStack};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Start a bridge from `local` to `remote` over `stack`
///
/// Datagrams up to `mtu` bytes are carried. Replies from the remote go to
/// whichever local sender spoke last. Both directions run on `tracker`
/// and stop together when `ctx` is cancelled or either side fails.
/// Returns the bound local address.
pub async fn start_bridge(
    ctx: CancellationToken,
    tracker: &TaskTracker,
    local: SocketAddr,
    remote: &str,
    stack: Arc<dyn NetStack>,
    mtu: u16,
) -> Result<SocketAddr, BridgeError> {
    let remote_addr = tokio::net::lookup_host(remote).await
        .map_err(|e| BridgeError::Resolve(remote.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| BridgeError::Resolve(remote.to_string(), "no addresses".into()))?;

    let socket = UdpSocket::bind(local).await
        .map_err(|e| BridgeError::Bind(local, e.to_string()))?;
    let bound = socket.local_addr()
        .map_err(|e| BridgeError::Bind(local, e.to_string()))?;

    let flow: Arc<dyn DatagramFlow> = Arc::from(
        stack.dial_udp(remote_addr).await
            .map_err(|e| BridgeError::Dial(remote_addr, e.to_string()))?,
    );

    let socket = Arc::new(socket);
    let last_sender = Arc::new(RwLock::new(None::<SocketAddr>));
    let buffer_size = mtu as usize;

    let stop = ctx.child_token();
    tracker.spawn(outbound(stop.clone(), socket.clone(), flow.clone(), last_sender.clone(), buffer_size));
    tracker.spawn(inbound(stop, socket, flow, last_sender, buffer_size));

    info!(local = %bound, remote = %remote_addr, mtu, "UDP bridge started");
    Ok(bound)
}

/// Local socket → remote through the stack
async fn outbound(
    stop: CancellationToken,
    socket: Arc<UdpSocket>,
    flow: Arc<dyn DatagramFlow>,
    last_sender: Arc<RwLock<Option<SocketAddr>>>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("bridge local receive failed: {}", e);
                    break;
                }
            },
            _ = stop.cancelled() => break,
        };

        {
            let mut last = last_sender.write().await;
            if *last != Some(from) {
                debug!(%from, "bridge client changed");
                *last = Some(from);
            }
        }

        if let Err(e) = flow.send(&buf[..n]).await {
            debug!("bridge send to remote failed: {}", e);
        }
    }
    stop.cancel();
    debug!("bridge outbound stopped");
}

/// Remote → last local sender
async fn inbound(
    stop: CancellationToken,
    socket: Arc<UdpSocket>,
    flow: Arc<dyn DatagramFlow>,
    last_sender: Arc<RwLock<Option<SocketAddr>>>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = tokio::select! {
            r = flow.recv(&mut buf) => match r {
                Ok(n) => n,
                Err(e) => {
                    warn!("bridge remote receive failed: {}", e);
                    break;
                }
            },
            _ = stop.cancelled() => break,
        };

        let Some(to) = *last_sender.read().await else {
            continue;
        };
        if let Err(e) = socket.send_to(&buf[..n], to).await {
            debug!(%to, "bridge send to client failed: {}", e);
        }
    }
    stop.cancel();
    debug!("bridge inbound stopped");
}

/// Bridge errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("cannot resolve {0}: {1}")]
    Resolve(String, String),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, String),

    #[error("cannot reach {0} through the stack: {1}")]
    Dial(SocketAddr, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BoxedStream;
    use crate::testing::HostStack;
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;

    /// Stack whose flows accept sends but fail every receive
    struct BrokenStack;

    struct BrokenFlow;

    #[async_trait]
    impl DatagramFlow for BrokenFlow {
        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "network stack stopped"))
        }
    }

    #[async_trait]
    impl NetStack for BrokenStack {
        async fn dial_tcp(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "network stack stopped"))
        }

        async fn dial_udp(&self, _addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>> {
            Ok(Box::new(BrokenFlow))
        }
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let echo = udp_echo().await;
        let ctx = CancellationToken::new();

        let bridge = start_bridge(
            ctx.clone(),
            &TaskTracker::new(),
            "127.0.0.1:0".parse().unwrap(),
            &echo.to_string(),
            Arc::new(HostStack),
            1330,
        )
        .await
        .unwrap();
        assert!(bridge.ip().is_loopback());
        assert_ne!(bridge.port(), 0);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"handshake initiation", bridge).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"handshake initiation");
        assert_eq!(from, bridge);

        ctx.cancel();
    }

    #[tokio::test]
    async fn test_bridge_unresolvable_remote() {
        let result = start_bridge(
            CancellationToken::new(),
            &TaskTracker::new(),
            "127.0.0.1:0".parse().unwrap(),
            "nowhere",
            Arc::new(HostStack),
            1330,
        )
        .await;

        assert!(matches!(result, Err(BridgeError::Resolve(_, _))));
    }

    #[tokio::test]
    async fn test_failed_direction_stops_both() {
        let echo = udp_echo().await;
        let ctx = CancellationToken::new();
        let tracker = TaskTracker::new();

        start_bridge(
            ctx.clone(),
            &tracker,
            "127.0.0.1:0".parse().unwrap(),
            &echo.to_string(),
            Arc::new(BrokenStack),
            1330,
        )
        .await
        .unwrap();

        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_drains_bridge_tasks() {
        let echo = udp_echo().await;
        let ctx = CancellationToken::new();
        let tracker = TaskTracker::new();

        start_bridge(
            ctx.clone(),
            &tracker,
            "127.0.0.1:0".parse().unwrap(),
            &echo.to_string(),
            Arc::new(HostStack),
            1330,
        )
        .await
        .unwrap();
        assert_eq!(tracker.len(), 2);

        ctx.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
    }
}
