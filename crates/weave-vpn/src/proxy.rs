//! SOCKS5 Exit Proxy
//!
//! Local SOCKS5 listener whose CONNECT requests are dialled through a
//! hop's userspace stack.
//!
//! # Protocol
//!
//! ```text
//! Client → SOCKS5 (bind address) → NetStack → tunnel → Internet
//! ```

use crate::device::{BoxedStream, NetStack};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Buffer size per direction
    pub buffer_size: usize,
    /// Handshake and dial timeout (seconds)
    pub timeout_secs: u64,
}

impl ProxyConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            max_connections: 512,
            buffer_size: 16 * 1024,
            timeout_secs: 30,
        }
    }
}

/// Bind a SOCKS5 proxy on `bind` backed by `stack`
///
/// The accept loop runs on `tracker` until `ctx` is cancelled.
/// Returns the bound address (useful when `bind` has port 0).
pub async fn start_local_proxy(
    ctx: CancellationToken,
    tracker: &TaskTracker,
    stack: Arc<dyn NetStack>,
    bind: SocketAddr,
) -> Result<SocketAddr, ProxyError> {
    let proxy = Socks5Proxy::bind(ProxyConfig::new(bind), stack).await?;
    let addr = proxy.local_addr();
    tracker.spawn(proxy.run(ctx));
    Ok(addr)
}

/// SOCKS5 proxy server
pub struct Socks5Proxy {
    config: ProxyConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    stack: Arc<dyn NetStack>,
    /// Limits concurrent connections
    semaphore: Arc<Semaphore>,
    active_connections: Arc<AtomicU64>,
}

impl Socks5Proxy {
    /// Bind the listening socket
    pub async fn bind(config: ProxyConfig, stack: Arc<dyn NetStack>) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen_addr).await
            .map_err(|e| ProxyError::Bind(config.listen_addr, e.to_string()))?;
        let local_addr = listener.local_addr()?;

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "SOCKS5 proxy listening"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            local_addr,
            stack,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Accept connections until `ctx` is cancelled
    pub async fn run(self, ctx: CancellationToken) {
        loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = ctx.cancelled() => break,
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = ctx.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let stack = self.stack.clone();
                    let active = self.active_connections.clone();
                    let ctx = ctx.clone();
                    let buffer_size = self.config.buffer_size;
                    let timeout = Duration::from_secs(self.config.timeout_secs);

                    active.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        debug!(%peer, "SOCKS5 connection");

                        tokio::select! {
                            result = handle_connection(stream, stack.as_ref(), buffer_size, timeout) => {
                                if let Err(e) = result {
                                    debug!(%peer, "connection error: {}", e);
                                }
                            }
                            _ = ctx.cancelled() => {}
                        }

                        active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => {
                    warn!("accept error: {}", e);
                }
            }
        }

        info!(
            address = %self.local_addr,
            active = self.active_connections(),
            "SOCKS5 proxy stopped"
        );
    }
}

/// Handle a single SOCKS5 connection
async fn handle_connection(
    mut stream: TcpStream,
    stack: &dyn NetStack,
    buffer_size: usize,
    timeout: Duration,
) -> Result<(), ProxyError> {
    let (host, port) = tokio::time::timeout(timeout, handshake(&mut stream)).await
        .map_err(|_| ProxyError::Timeout)??;

    debug!("SOCKS5 CONNECT to {}:{}", host, port);

    let remote = match tokio::time::timeout(timeout, stack.dial_tcp(&host, port)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            send_reply(&mut stream, dial_failure_reply(&e)).await?;
            return Err(ProxyError::Connect(format!("{}:{}", host, port), e.to_string()));
        }
        Err(_) => {
            send_reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
            return Err(ProxyError::Timeout);
        }
    };

    send_reply(&mut stream, REPLY_SUCCESS).await?;
    relay(stream, remote, buffer_size).await?;

    Ok(())
}

/// Reply code for a failed dial
fn dial_failure_reply(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        // The stack itself is gone, not the target
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => REPLY_GENERAL_FAILURE,
        _ => REPLY_HOST_UNREACHABLE,
    }
}

/// Negotiate no-auth and read the CONNECT target
async fn handshake(stream: &mut TcpStream) -> Result<(String, u16), ProxyError> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion(buf[0]));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(ProxyError::AuthNotSupported);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion(header[0]));
    }

    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(ProxyError::UnsupportedCommand(header[1]));
    }

    let host = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| ProxyError::InvalidAddress)?
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => {
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(ProxyError::InvalidAddress);
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok((host, u16::from_be_bytes(port)))
}

async fn send_reply(stream: &mut TcpStream, reply: u8) -> Result<(), ProxyError> {
    let response = [
        SOCKS5_VERSION,
        reply,
        0x00, // Reserved
        ADDR_IPV4,
        0, 0, 0, 0, // Bind address (0.0.0.0)
        0, 0,       // Bind port (0)
    ];
    stream.write_all(&response).await?;
    Ok(())
}

/// Relay data between the client and the tunnel stream
async fn relay(mut client: TcpStream, remote: BoxedStream, buffer_size: usize) -> Result<(), ProxyError> {
    let (client_read, client_write) = client.split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    tokio::try_join!(
        pump(client_read, remote_write, buffer_size),
        pump(remote_read, client_write, buffer_size),
    )?;

    Ok(())
}

/// Copy until EOF, then half-close the writer
async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    writer.shutdown().await
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, String),

    #[error("invalid SOCKS version {0:#04x}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication method")]
    AuthNotSupported,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("invalid address")]
    InvalidAddress,

    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DatagramFlow;
    use crate::testing::HostStack;
    use async_trait::async_trait;

    /// Stack whose engine has already shut down
    struct StoppedStack;

    #[async_trait]
    impl NetStack for StoppedStack {
        async fn dial_tcp(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "network stack stopped"))
        }

        async fn dial_udp(&self, _addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "network stack stopped"))
        }
    }

    async fn start(ctx: &CancellationToken, stack: Arc<dyn NetStack>) -> SocketAddr {
        start_local_proxy(ctx.clone(), &TaskTracker::new(), stack, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn connect_request(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await.unwrap();

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        let ip = match target.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => unreachable!(),
        };
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_IPV4];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        client
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let echo = echo_server().await;
        let ctx = CancellationToken::new();
        let proxy = start(&ctx, Arc::new(HostStack)).await;
        assert_ne!(proxy.port(), 0);

        let mut client = connect_request(proxy, echo).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        client.write_all(b"through the tunnel").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"through the tunnel");

        ctx.cancel();
    }

    #[tokio::test]
    async fn test_refused_target() {
        let ctx = CancellationToken::new();
        let proxy = start(&ctx, Arc::new(HostStack)).await;
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let mut client = connect_request(proxy, closed).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);

        ctx.cancel();
    }

    #[tokio::test]
    async fn test_stopped_stack_is_general_failure() {
        let ctx = CancellationToken::new();
        let proxy = start(&ctx, Arc::new(StoppedStack)).await;

        let mut client = connect_request(proxy, "10.0.0.1:80".parse().unwrap()).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_GENERAL_FAILURE);

        ctx.cancel();
    }

    #[test]
    fn test_dial_failure_replies() {
        let reply = |kind| dial_failure_reply(&io::Error::new(kind, "dial"));
        assert_eq!(reply(io::ErrorKind::ConnectionRefused), REPLY_CONNECTION_REFUSED);
        assert_eq!(reply(io::ErrorKind::BrokenPipe), REPLY_GENERAL_FAILURE);
        assert_eq!(reply(io::ErrorKind::TimedOut), REPLY_HOST_UNREACHABLE);
        assert_eq!(reply(io::ErrorKind::AddrNotAvailable), REPLY_HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_rejects_auth_only_clients() {
        let ctx = CancellationToken::new();
        let proxy = start(&ctx, Arc::new(HostStack)).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, 0x02]).await.unwrap();

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]);

        ctx.cancel();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = start_local_proxy(CancellationToken::new(), &TaskTracker::new(), Arc::new(HostStack), addr).await;
        assert!(matches!(result, Err(ProxyError::Bind(_, _))));
    }

    #[tokio::test]
    async fn test_cancel_stops_listener() {
        let ctx = CancellationToken::new();
        let tracker = TaskTracker::new();
        let proxy = start_local_proxy(ctx.clone(), &tracker, Arc::new(HostStack), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        ctx.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();

        assert!(TcpStream::connect(proxy).await.is_err());
    }
}
