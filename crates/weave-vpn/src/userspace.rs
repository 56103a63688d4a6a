//! Userspace WireGuard Backend
//!
//! Runs a hop entirely in-process: boringtun keeps the WireGuard session
//! and a smoltcp interface on a virtual IP device carries the TCP and UDP
//! flows dialled through the hop's [`NetStack`].
//!
//! # Data path
//!
//! ```text
//! dial_tcp / dial_udp ──▶ smoltcp sockets ──▶ VirtualDevice ──▶ Tunn::encapsulate ──UDP──▶ peer
//!                      ◀──                ◀──               ◀── Tunn::decapsulate ◀──UDP──
//! ```
//!
//! One driver task per hop owns the interface, the socket set and the
//! WireGuard session. Callers talk to it over channels.

use crate::device::{BoxedStream, DatagramFlow, DeviceError, NetStack, TunnelBackend};
use crate::dns;
use crate::profile::TunnelConfig;
use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey as PeerPublic, StaticSecret};
use rand::Rng;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{self, DeviceCapabilities, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// WireGuard timer resolution
const TIMER_TICK: Duration = Duration::from_millis(100);

/// Largest datagram read from the peer socket
const DATAGRAM_MAX: usize = 65535;

/// Room boringtun needs around a packet
const WG_OVERHEAD: usize = 148;

const TCP_BUFFER: usize = 256 * 1024;
const UDP_PACKETS: usize = 64;
const UDP_BUFFER: usize = 64 * 1024;
const STREAM_CHUNK: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 64;

/// Local ports handed to sockets on the virtual interface
const PORT_FIRST: u16 = 40000;
const PORT_LAST: u16 = 65000;

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// Length and type byte of a WireGuard handshake initiation
const HANDSHAKE_INIT_LEN: usize = 148;
const HANDSHAKE_INIT_TYPE: u8 = 1;

/// Backend running WireGuard and TCP/IP in-process
#[derive(Debug)]
pub struct UserspaceBackend {
    tracker: TaskTracker,
    next: AtomicU32,
}

impl UserspaceBackend {
    /// Backend whose driver tasks run on `tracker`
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            tracker,
            next: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TunnelBackend for UserspaceBackend {
    type Device = UserspaceDevice;

    async fn create_os_interface(&self) -> Result<UserspaceDevice, DeviceError> {
        Err(DeviceError::Unsupported("OS interfaces with the userspace backend"))
    }

    async fn create_userspace_stack(
        &self,
        config: &TunnelConfig,
    ) -> Result<(UserspaceDevice, Arc<dyn NetStack>), DeviceError> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let name = format!("netstack{}", index);

        let v4 = config.interface.addresses.iter().find_map(|c| match c.addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        });
        let v6 = config.interface.addresses.iter().find_map(|c| match c.addr {
            IpAddr::V6(addr) => Some(addr),
            IpAddr::V4(_) => None,
        });
        if v4.is_none() && v6.is_none() {
            return Err(DeviceError::InvalidConfig("interface has no address".into()));
        }

        let mut phy = VirtualDevice::new(config.interface.mtu);
        let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut phy, now());
        iface.update_ip_addrs(|addrs| {
            for cidr in &config.interface.addresses {
                if addrs.push(IpCidr::new(IpAddress::from(cidr.addr), cidr.prefix)).is_err() {
                    warn!(stack = %name, address = %cidr, "interface address table full");
                }
            }
        });
        // Medium::Ip has no neighbours; any gateway routes everything
        if v4.is_some() {
            let _ = iface.routes_mut().add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
        }
        if v6.is_some() {
            let _ = iface.routes_mut().add_default_ipv6_route(Ipv6Addr::LOCALHOST);
        }

        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_DEPTH);
        let wake = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        let stack = UserspaceStack {
            name: name.clone(),
            commands: commands_tx,
            wake: wake.clone(),
            stop: stop.clone(),
            dns: config.interface.dns.clone(),
            tracker: self.tracker.clone(),
        };

        let device = UserspaceDevice {
            name,
            index,
            iface,
            phy,
            sockets: SocketSet::new(vec![]),
            commands: commands_rx,
            wake,
            stop,
            v4,
            v6,
            next_port: PORT_FIRST,
            tcp: Vec::new(),
            udp: Vec::new(),
        };

        debug!(stack = %device.name, mtu = config.interface.mtu, ?v4, ?v6, "userspace stack created");
        Ok((device, Arc::new(stack)))
    }

    async fn establish(
        &self,
        ctx: &CancellationToken,
        config: &TunnelConfig,
        device: UserspaceDevice,
        _fwmark: u32,
    ) -> Result<(), DeviceError> {
        let peer = config.peers.first()
            .ok_or_else(|| DeviceError::InvalidConfig("no peer".into()))?;
        if config.peers.len() > 1 {
            warn!(stack = %device.name, peers = config.peers.len(), "only the first peer is used");
        }
        let endpoint = peer.resolved
            .ok_or_else(|| DeviceError::InvalidConfig("peer endpoint is not resolved".into()))?;

        let bind: SocketAddr = if endpoint.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await
            .map_err(|e| DeviceError::Other(format!("bind {}: {}", bind, e)))?;
        socket.connect(endpoint).await
            .map_err(|e| DeviceError::Other(format!("connect {}: {}", endpoint, e)))?;

        let tunn = Tunn::new(
            StaticSecret::from(config.interface.private_key.to_bytes()),
            PeerPublic::from(peer.public_key.to_bytes()),
            peer.preshared_key.as_ref().map(|k| k.to_bytes()),
            (peer.keepalive > 0).then_some(peer.keepalive),
            device.index,
            None,
        ).map_err(|e| DeviceError::Other(format!("tunnel: {}", e)))?;

        let mut session = Session {
            tunn,
            socket,
            trick: peer.trick,
            buf: vec![0u8; DATAGRAM_MAX + WG_OVERHEAD],
        };
        session.initiate().await;

        info!(
            stack = %device.name,
            %endpoint,
            keepalive = peer.keepalive,
            trick = peer.trick,
            "userspace tunnel scheduled"
        );
        self.tracker.spawn(drive(ctx.clone(), device, session));

        Ok(())
    }

    fn device_name(&self, device: &UserspaceDevice) -> String {
        device.name.clone()
    }
}

/// Requests from the stack handle to the driver task
enum Command {
    Tcp {
        remote: SocketAddr,
        from_client: mpsc::Receiver<Vec<u8>>,
        to_client: mpsc::Sender<Vec<u8>>,
        connected: oneshot::Sender<io::Result<()>>,
    },
    Udp {
        remote: SocketAddr,
        from_client: mpsc::Receiver<Vec<u8>>,
        to_client: mpsc::Sender<Vec<u8>>,
        bound: oneshot::Sender<io::Result<()>>,
    },
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "network stack stopped")
}

/// Handle for dialling through a userspace hop
pub struct UserspaceStack {
    name: String,
    commands: mpsc::Sender<Command>,
    wake: Arc<Notify>,
    stop: CancellationToken,
    dns: Vec<IpAddr>,
    tracker: TaskTracker,
}

impl UserspaceStack {
    /// Look up `host` through the tunnel's resolver
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let server = self.dns.first().copied().unwrap_or(FALLBACK_DNS);
        let query_id: u16 = rand::random();
        let query = dns::build_query(query_id, host)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid host name {}", host)))?;

        let flow = self.dial_udp(SocketAddr::new(server, DNS_PORT)).await?;
        flow.send(&query).await?;

        let mut buf = vec![0u8; 1500];
        let n = tokio::time::timeout(DNS_TIMEOUT, flow.recv(&mut buf)).await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("no DNS answer for {}", host)))??;

        let addr = dns::first_address(query_id, &buf[..n])
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))?;
        debug!(stack = %self.name, host, %addr, "resolved through tunnel");
        Ok(IpAddr::V4(addr))
    }
}

#[async_trait]
impl NetStack for UserspaceStack {
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => self.resolve(host).await?,
        };

        let (to_loop, from_client) = mpsc::channel(CHANNEL_DEPTH);
        let (to_client, mut from_loop) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (connected_tx, connected_rx) = oneshot::channel();

        self.commands
            .send(Command::Tcp {
                remote: SocketAddr::new(ip, port),
                from_client,
                to_client,
                connected: connected_tx,
            })
            .await
            .map_err(|_| stopped())?;
        connected_rx.await.map_err(|_| stopped())??;

        let (ours, theirs) = tokio::io::duplex(STREAM_CHUNK * 4);
        let (mut reader, mut writer) = tokio::io::split(ours);

        let wake = self.wake.clone();
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                let n = tokio::select! {
                    r = reader.read(&mut buf) => match r {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                    _ = stop.cancelled() => break,
                };
                if to_loop.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
                wake.notify_one();
            }
            drop(to_loop);
            wake.notify_one();
        });

        let wake = self.wake.clone();
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = from_loop.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                    _ = stop.cancelled() => break,
                };
                // Room freed in the channel; let the driver push more
                wake.notify_one();
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(Box::new(theirs))
    }

    async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramFlow>> {
        let (to_loop, from_client) = mpsc::channel(CHANNEL_DEPTH);
        let (to_client, from_loop) = mpsc::channel(CHANNEL_DEPTH);
        let (bound_tx, bound_rx) = oneshot::channel();

        self.commands
            .send(Command::Udp {
                remote: addr,
                from_client,
                to_client,
                bound: bound_tx,
            })
            .await
            .map_err(|_| stopped())?;
        bound_rx.await.map_err(|_| stopped())??;

        Ok(Box::new(StackFlow {
            to_loop,
            from_loop: Mutex::new(from_loop),
            wake: self.wake.clone(),
        }))
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

/// UDP flow bound on the virtual interface
struct StackFlow {
    to_loop: mpsc::Sender<Vec<u8>>,
    from_loop: Mutex<mpsc::Receiver<Vec<u8>>>,
    wake: Arc<Notify>,
}

#[async_trait]
impl DatagramFlow for StackFlow {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.to_loop.send(buf.to_vec()).await.map_err(|_| stopped())?;
        self.wake.notify_one();
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self.from_loop.lock().await.recv().await.ok_or_else(stopped)?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }
}

/// In-memory IP device between smoltcp and the WireGuard session
struct VirtualDevice {
    /// Decrypted packets waiting for smoltcp
    inbound: VecDeque<Vec<u8>>,
    /// Packets from smoltcp waiting for encryption
    outbound: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl VirtualDevice {
    fn new(mtu: u16) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu: mtu as usize,
        }
    }
}

struct VirtRxToken(Vec<u8>);

impl phy::RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl phy::TxToken for VirtTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        self.0.push_back(packet);
        result
    }
}

impl phy::Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(&mut self, _timestamp: smoltcp::time::Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        Some((VirtRxToken(packet), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

fn now() -> smoltcp::time::Instant {
    smoltcp::time::Instant::now()
}

/// Userspace device owned by a hop until its driver starts
///
/// Holds only in-process state, so dropping it releases everything.
pub struct UserspaceDevice {
    name: String,
    index: u32,
    iface: Interface,
    phy: VirtualDevice,
    sockets: SocketSet<'static>,
    commands: mpsc::Receiver<Command>,
    wake: Arc<Notify>,
    stop: CancellationToken,
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
    next_port: u16,
    tcp: Vec<TcpFlow>,
    udp: Vec<UdpFlow>,
}

impl std::fmt::Debug for UserspaceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserspaceDevice")
            .field("name", &self.name)
            .field("v4", &self.v4)
            .field("v6", &self.v6)
            .finish()
    }
}

impl UserspaceDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn local_endpoint(&mut self, remote: IpAddr) -> io::Result<IpListenEndpoint> {
        let addr = match remote {
            IpAddr::V4(_) => self.v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.v6.map(IpAddr::V6),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no interface address for this family"))?;

        let port = self.next_port;
        self.next_port = if port >= PORT_LAST { PORT_FIRST } else { port + 1 };

        Ok(IpListenEndpoint {
            addr: Some(IpAddress::from(addr)),
            port,
        })
    }

    fn accept(&mut self, command: Command) {
        match command {
            Command::Tcp { remote, from_client, to_client, connected } => {
                let local = match self.local_endpoint(remote.ip()) {
                    Ok(local) => local,
                    Err(e) => {
                        let _ = connected.send(Err(e));
                        return;
                    }
                };

                let mut socket = tcp::Socket::new(
                    tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
                    tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
                );
                socket.set_nagle_enabled(false);

                let target = IpEndpoint::new(IpAddress::from(remote.ip()), remote.port());
                if let Err(e) = socket.connect(self.iface.context(), target, local) {
                    let _ = connected.send(Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())));
                    return;
                }

                debug!(stack = %self.name, %remote, "TCP connect");
                let handle = self.sockets.add(socket);
                self.tcp.push(TcpFlow {
                    handle,
                    connected: Some(connected),
                    from_client,
                    to_client: Some(to_client),
                    incoming: None,
                    outgoing: Vec::new(),
                    offset: 0,
                    client_done: false,
                    closing: false,
                });
            }
            Command::Udp { remote, from_client, to_client, bound } => {
                let local = match self.local_endpoint(remote.ip()) {
                    Ok(local) => local,
                    Err(e) => {
                        let _ = bound.send(Err(e));
                        return;
                    }
                };

                let mut socket = udp::Socket::new(
                    udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; UDP_PACKETS], vec![0; UDP_BUFFER]),
                    udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; UDP_PACKETS], vec![0; UDP_BUFFER]),
                );
                if let Err(e) = socket.bind(local) {
                    let _ = bound.send(Err(io::Error::new(io::ErrorKind::AddrInUse, e.to_string())));
                    return;
                }

                let handle = self.sockets.add(socket);
                self.udp.push(UdpFlow {
                    handle,
                    remote: IpEndpoint::new(IpAddress::from(remote.ip()), remote.port()),
                    from_client,
                    to_client,
                });
                let _ = bound.send(Ok(()));
            }
        }
    }

    /// Move data between the smoltcp sockets and their callers
    fn service(&mut self) {
        let sockets = &mut self.sockets;
        let mut finished = Vec::new();

        self.tcp.retain_mut(|flow| {
            let keep = flow.service(sockets.get_mut::<tcp::Socket>(flow.handle));
            if !keep {
                finished.push(flow.handle);
            }
            keep
        });
        self.udp.retain_mut(|flow| {
            let keep = flow.service(sockets.get_mut::<udp::Socket>(flow.handle));
            if !keep {
                finished.push(flow.handle);
            }
            keep
        });

        for handle in finished {
            self.sockets.remove(handle);
        }
    }

    fn poll(&mut self) {
        let timestamp = now();
        let _ = self.iface.poll(timestamp, &mut self.phy, &mut self.sockets);
        self.service();
        let _ = self.iface.poll(timestamp, &mut self.phy, &mut self.sockets);
    }

    fn poll_delay(&mut self) -> Duration {
        self.iface
            .poll_delay(now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
            .unwrap_or(TIMER_TICK)
            .min(TIMER_TICK)
    }
}

/// TCP connection between a caller's duplex stream and a smoltcp socket
struct TcpFlow {
    handle: SocketHandle,
    connected: Option<oneshot::Sender<io::Result<()>>>,
    from_client: mpsc::Receiver<Vec<u8>>,
    /// Dropped once the remote side has finished sending
    to_client: Option<mpsc::Sender<Vec<u8>>>,
    /// Chunk read from the socket that the caller had no room for yet
    incoming: Option<Vec<u8>>,
    outgoing: Vec<u8>,
    offset: usize,
    client_done: bool,
    closing: bool,
}

impl TcpFlow {
    /// Returns false once the flow is finished
    fn service(&mut self, socket: &mut tcp::Socket) -> bool {
        if let Some(connected) = self.connected.take() {
            if socket.may_send() {
                let _ = connected.send(Ok(()));
            } else if socket.state() == tcp::State::Closed {
                let _ = connected.send(Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")));
                return false;
            } else if connected.is_closed() {
                // Caller gave up while connecting
                socket.abort();
                return false;
            } else {
                self.connected = Some(connected);
                return true;
            }
        }

        // Tunnel → caller
        let mut remote_done = false;
        if let Some(to_client) = &self.to_client {
            loop {
                if self.incoming.is_none() && socket.can_recv() {
                    let mut chunk = vec![0u8; STREAM_CHUNK];
                    if let Ok(n) = socket.recv_slice(&mut chunk) {
                        if n > 0 {
                            chunk.truncate(n);
                            self.incoming = Some(chunk);
                        }
                    }
                }
                let Some(chunk) = self.incoming.take() else {
                    break;
                };
                match to_client.try_send(chunk) {
                    Ok(()) => {}
                    Err(TrySendError::Full(chunk)) => {
                        self.incoming = Some(chunk);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        socket.abort();
                        return false;
                    }
                }
            }
            remote_done = self.incoming.is_none() && !socket.may_recv() && !socket.can_recv();
        }
        if remote_done {
            self.to_client = None;
        }

        // Caller → tunnel
        loop {
            if self.offset >= self.outgoing.len() {
                self.outgoing.clear();
                self.offset = 0;
                if self.client_done {
                    break;
                }
                match self.from_client.try_recv() {
                    Ok(chunk) => self.outgoing = chunk,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.client_done = true;
                        break;
                    }
                }
            }
            if !socket.can_send() {
                break;
            }
            match socket.send_slice(&self.outgoing[self.offset..]) {
                Ok(0) => break,
                Ok(n) => self.offset += n,
                Err(_) => {
                    socket.abort();
                    return false;
                }
            }
        }

        if self.client_done && self.outgoing.is_empty() && !self.closing {
            socket.close();
            self.closing = true;
        }

        socket.is_open()
    }
}

/// UDP flow between a caller and a smoltcp socket
struct UdpFlow {
    handle: SocketHandle,
    remote: IpEndpoint,
    from_client: mpsc::Receiver<Vec<u8>>,
    to_client: mpsc::Sender<Vec<u8>>,
}

impl UdpFlow {
    /// Returns false once the caller has dropped the flow
    fn service(&mut self, socket: &mut udp::Socket) -> bool {
        if self.to_client.is_closed() {
            return false;
        }

        while socket.can_send() {
            match self.from_client.try_recv() {
                Ok(datagram) => {
                    if let Err(e) = socket.send_slice(&datagram, self.remote) {
                        debug!(remote = %self.remote, "datagram dropped: {}", e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }

        while socket.can_recv() {
            let Ok((datagram, _)) = socket.recv() else {
                break;
            };
            // Datagrams the caller has no room for are dropped
            if let Err(TrySendError::Closed(_)) = self.to_client.try_send(datagram.to_vec()) {
                return false;
            }
        }

        true
    }
}

/// WireGuard session and the UDP socket to the peer
struct Session {
    tunn: Tunn,
    socket: UdpSocket,
    trick: bool,
    buf: Vec<u8>,
}

impl Session {
    async fn initiate(&mut self) {
        if let TunnResult::WriteToNetwork(packet) = self.tunn.format_handshake_initiation(&mut self.buf, false) {
            transmit(&self.socket, self.trick, packet).await;
        }
    }

    /// Handle one datagram from the peer
    async fn receive(&mut self, datagram: &[u8], phy: &mut VirtualDevice) {
        match self.tunn.decapsulate(None, datagram, &mut self.buf) {
            TunnResult::WriteToNetwork(packet) => {
                transmit(&self.socket, self.trick, packet).await;
                // Flush packets queued while the handshake was pending
                while let TunnResult::WriteToNetwork(packet) = self.tunn.decapsulate(None, &[], &mut self.buf) {
                    transmit(&self.socket, self.trick, packet).await;
                }
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                phy.inbound.push_back(packet.to_vec());
            }
            TunnResult::Err(e) => debug!("dropped datagram from peer: {:?}", e),
            TunnResult::Done => {}
        }
    }

    /// Encrypt one IP packet from the stack
    async fn send(&mut self, packet: &[u8]) {
        match self.tunn.encapsulate(packet, &mut self.buf) {
            TunnResult::WriteToNetwork(datagram) => transmit(&self.socket, self.trick, datagram).await,
            TunnResult::Err(e) => debug!("dropped packet to peer: {:?}", e),
            _ => {}
        }
    }

    async fn tick(&mut self) {
        match self.tunn.update_timers(&mut self.buf) {
            TunnResult::WriteToNetwork(packet) => transmit(&self.socket, self.trick, packet).await,
            TunnResult::Err(e) => debug!("WireGuard timer: {:?}", e),
            _ => {}
        }
    }
}

/// Send one datagram to the peer, preceded by junk ahead of handshakes
/// when traffic shaping is on
async fn transmit(socket: &UdpSocket, trick: bool, packet: &[u8]) {
    if trick && is_handshake_initiation(packet) {
        let junk = junk_datagram();
        if let Err(e) = socket.send(&junk).await {
            debug!("shaping datagram not sent: {}", e);
        }
    }
    if let Err(e) = socket.send(packet).await {
        debug!("send to peer failed: {}", e);
    }
}

fn is_handshake_initiation(packet: &[u8]) -> bool {
    packet.len() == HANDSHAKE_INIT_LEN && packet[0] == HANDSHAKE_INIT_TYPE
}

fn junk_datagram() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut junk = vec![0u8; rng.gen_range(16..64)];
    rng.fill(&mut junk[..]);
    junk
}

enum Event {
    Cancelled,
    Readable,
    Command(Command),
    Closed,
    Wake,
    Tick,
}

/// Driver task: owns the device and session until `ctx` is cancelled
async fn drive(ctx: CancellationToken, mut device: UserspaceDevice, mut session: Session) {
    let mut datagram = vec![0u8; DATAGRAM_MAX];
    let mut timers = tokio::time::interval(TIMER_TICK);
    timers.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Cleared once every stack handle is gone
    let mut accepting = true;

    loop {
        while let Ok(command) = device.commands.try_recv() {
            device.accept(command);
        }

        loop {
            match session.socket.try_recv(&mut datagram) {
                Ok(n) => session.receive(&datagram[..n], &mut device.phy).await,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(stack = %device.name, "peer socket error: {}", e);
                    break;
                }
            }
        }

        device.poll();
        while let Some(packet) = device.phy.outbound.pop_front() {
            session.send(&packet).await;
        }

        let delay = device.poll_delay();
        let event = tokio::select! {
            _ = ctx.cancelled() => Event::Cancelled,
            _ = session.socket.readable() => Event::Readable,
            command = device.commands.recv(), if accepting => match command {
                Some(command) => Event::Command(command),
                None => Event::Closed,
            },
            _ = device.wake.notified() => Event::Wake,
            _ = timers.tick() => Event::Tick,
            _ = tokio::time::sleep(delay) => Event::Wake,
        };

        match event {
            Event::Cancelled => break,
            Event::Command(command) => device.accept(command),
            Event::Closed => accepting = false,
            Event::Tick => session.tick().await,
            Event::Readable | Event::Wake => {}
        }
    }

    device.stop.cancel();
    info!(stack = %device.name, "userspace tunnel stopped");
}
