//! User-space network stack over a WireGuard session.
//!
//! One engine task per tunnel owns the boringtun [`Tunn`], the UDP socket to
//! the peer and a smoltcp interface backed by in-memory buffers. Dialled
//! streams talk to the engine over channels; the engine moves bytes between
//! smoltcp sockets and those channels, and encrypts/decrypts whole IP
//! packets at the device edge.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use smoltcp::iface::{Config, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use splitroute_model::TunnelState;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

use super::awg::{AwgParams, Obfuscated};
use crate::{DatagramTunnel, ProviderError, StateCell, TunnelStream};

/// Largest UDP datagram we may receive from the peer.
const MAX_UDP_SIZE: usize = (1 << 16) - 1;
const TCP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;
const CLIENT_CHANNEL_CAPACITY: usize = 32;
const TIMER_GRANULARITY: Duration = Duration::from_millis(250);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound on pump iterations per event, in case smoltcp keeps
/// reporting progress.
const MAX_PUMP_ITERS: usize = 8;

pub(crate) enum Command {
    WaitHandshake {
        reply: oneshot::Sender<Result<(), ProviderError>>,
    },
    DialTcp {
        dst: SocketAddrV4,
        reply: oneshot::Sender<Result<TunnelStream, ProviderError>>,
    },
    DialUdp {
        dst: SocketAddrV4,
        reply: oneshot::Sender<Result<Box<dyn DatagramTunnel>, ProviderError>>,
    },
    InjectRaw(Vec<u8>),
}

enum ClientMsg {
    Data(Vec<u8>),
    Close,
}

pub(crate) struct EngineHandle {
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) task: tokio::task::JoinHandle<()>,
}

pub(crate) fn spawn(
    tunn: Tunn,
    socket: UdpSocket,
    local_ip: Ipv4Addr,
    mtu: usize,
    awg: AwgParams,
    state: Arc<StateCell>,
) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (from_client_tx, from_client_rx) = mpsc::channel(256);

    let mut device = InMemoryDevice::new(mtu);
    let iface = make_interface(&mut device, local_ip);

    let engine = Engine {
        tunn,
        socket,
        awg,
        state,
        device,
        iface,
        sockets: SocketSet::new(Vec::new()),
        local_ip,
        streams: HashMap::new(),
        datagrams: HashMap::new(),
        cmd_rx,
        from_client_rx,
        from_client_tx,
        pending_handshake: None,
        next_port: 49152,
    };

    let task = tokio::spawn(engine.run());

    EngineHandle { cmd_tx, task }
}

struct PendingConnect {
    reply: oneshot::Sender<Result<TunnelStream, ProviderError>>,
    stream: WgStream,
    deadline: tokio::time::Instant,
    dst: SocketAddrV4,
}

struct TcpBridge {
    /// Read path towards the client; `None` once EOF was signalled.
    to_client: Option<mpsc::Sender<Vec<u8>>>,
    /// Client data not yet accepted by the smoltcp socket.
    pending: VecDeque<Vec<u8>>,
    pending_offset: usize,
    connect: Option<PendingConnect>,
    client_closed: bool,
}

struct UdpBridge {
    to_client: mpsc::Sender<Vec<u8>>,
    remote: IpEndpoint,
}

struct PendingHandshake {
    reply: oneshot::Sender<Result<(), ProviderError>>,
    deadline: tokio::time::Instant,
}

enum Event {
    Command(Option<Command>),
    Client(Option<(SocketHandle, ClientMsg)>),
    Datagram(std::io::Result<usize>),
    Tick,
}

struct Engine {
    tunn: Tunn,
    socket: UdpSocket,
    awg: AwgParams,
    state: Arc<StateCell>,

    device: InMemoryDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    local_ip: Ipv4Addr,

    streams: HashMap<SocketHandle, TcpBridge>,
    datagrams: HashMap<SocketHandle, UdpBridge>,

    cmd_rx: mpsc::Receiver<Command>,
    from_client_rx: mpsc::Receiver<(SocketHandle, ClientMsg)>,
    from_client_tx: mpsc::Sender<(SocketHandle, ClientMsg)>,

    pending_handshake: Option<PendingHandshake>,
    next_port: u16,
}

impl Engine {
    async fn run(mut self) {
        let mut scratch = vec![0u8; MAX_UDP_SIZE];
        let mut recv_buf = vec![0u8; MAX_UDP_SIZE];

        let mut timers = tokio::time::interval(TIMER_GRANULARITY);
        timers.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.pump(&mut scratch).await;
            self.settle_handshake(false);

            let event = tokio::select! {
                command = self.cmd_rx.recv() => Event::Command(command),
                msg = self.from_client_rx.recv() => Event::Client(msg),
                result = self.socket.recv(&mut recv_buf) => Event::Datagram(result),
                _ = timers.tick() => Event::Tick,
            };

            match event {
                Event::Command(Some(command)) => self.handle_command(command, &mut scratch).await,
                // The provider hung up; tear everything down.
                Event::Command(None) => break,
                Event::Client(Some((handle, msg))) => self.handle_client_msg(handle, msg),
                Event::Client(None) => break,
                Event::Datagram(Ok(n)) => {
                    self.handle_datagram(&mut recv_buf[..n], &mut scratch).await;
                }
                Event::Datagram(Err(e)) => {
                    tracing::debug!("Failed to receive from peer: {e}");
                }
                Event::Tick => self.handle_tick(&mut scratch).await,
            }
        }

        tracing::debug!("WireGuard engine stopped");
    }

    async fn handle_command(&mut self, command: Command, scratch: &mut [u8]) {
        match command {
            Command::WaitHandshake { reply } => {
                for junk in self.awg.junk_packets() {
                    if let Err(e) = self.socket.send(&junk).await {
                        tracing::debug!("Failed to send junk datagram: {e}");
                    }
                }

                match self.tunn.format_handshake_initiation(scratch, false) {
                    TunnResult::WriteToNetwork(wire) => {
                        transmit(&self.socket, &self.awg, wire).await;
                    }
                    TunnResult::Done => {}
                    TunnResult::Err(e) => tracing::debug!("Failed to format handshake: {e:?}"),
                    TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                        debug_assert!(false, "handshake initiation cannot decrypt data")
                    }
                }

                self.pending_handshake = Some(PendingHandshake {
                    reply,
                    deadline: tokio::time::Instant::now() + HANDSHAKE_TIMEOUT,
                });
            }
            Command::DialTcp { dst, reply } => self.dial_tcp(dst, reply),
            Command::DialUdp { dst, reply } => self.dial_udp(dst, reply),
            Command::InjectRaw(packet) => self.send_through_tunnel(&packet, scratch).await,
        }
    }

    fn dial_tcp(
        &mut self,
        dst: SocketAddrV4,
        reply: oneshot::Sender<Result<TunnelStream, ProviderError>>,
    ) {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);
        socket.set_timeout(Some(smoltcp::time::Duration::from_secs(600)));

        let local_port = self.next_local_port();
        let remote = IpEndpoint::new(IpAddress::from(*dst.ip()), dst.port());
        let local = IpListenEndpoint {
            addr: Some(IpAddress::from(self.local_ip)),
            port: local_port,
        };

        if let Err(e) = socket.connect(self.iface.context(), remote, local) {
            let _ = reply.send(Err(ProviderError::Io(std::io::Error::other(format!(
                "connect to {dst} failed: {e}"
            )))));
            return;
        }

        let handle = self.sockets.add(socket);
        let (to_client, read_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let stream = WgStream {
            handle,
            read_rx,
            leftover: None,
            write_tx: PollSender::new(self.from_client_tx.clone()),
            shutdown_sent: false,
        };

        self.streams.insert(
            handle,
            TcpBridge {
                to_client: Some(to_client),
                pending: VecDeque::new(),
                pending_offset: 0,
                connect: Some(PendingConnect {
                    reply,
                    stream,
                    deadline: tokio::time::Instant::now() + DIAL_TIMEOUT,
                    dst,
                }),
                client_closed: false,
            },
        );
    }

    fn dial_udp(
        &mut self,
        dst: SocketAddrV4,
        reply: oneshot::Sender<Result<Box<dyn DatagramTunnel>, ProviderError>>,
    ) {
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; 64],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; 64],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);

        let local_port = self.next_local_port();
        let local = IpListenEndpoint {
            addr: Some(IpAddress::from(self.local_ip)),
            port: local_port,
        };

        if let Err(e) = socket.bind(local) {
            let _ = reply.send(Err(ProviderError::Io(std::io::Error::other(format!(
                "bind for {dst} failed: {e}"
            )))));
            return;
        }

        let handle = self.sockets.add(socket);
        let (to_client, read_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);

        let datagram = WgDatagram {
            handle,
            read_rx: tokio::sync::Mutex::new(read_rx),
            write_tx: self.from_client_tx.clone(),
        };

        let _ = reply.send(Ok(Box::new(datagram)));

        self.datagrams.insert(
            handle,
            UdpBridge {
                to_client,
                remote: IpEndpoint::new(IpAddress::from(*dst.ip()), dst.port()),
            },
        );
    }

    fn handle_client_msg(&mut self, handle: SocketHandle, msg: ClientMsg) {
        if let Some(bridge) = self.streams.get_mut(&handle) {
            match msg {
                ClientMsg::Data(data) => bridge.pending.push_back(data),
                ClientMsg::Close => bridge.client_closed = true,
            }

            return;
        }

        if let Some(bridge) = self.datagrams.get(&handle) {
            match msg {
                ClientMsg::Data(data) => {
                    let socket = self.sockets.get_mut::<udp::Socket>(handle);

                    if let Err(e) = socket.send_slice(&data, bridge.remote) {
                        tracing::debug!(remote = %bridge.remote, "Failed to send datagram: {e}");
                    }
                }
                ClientMsg::Close => {
                    self.datagrams.remove(&handle);
                    self.sockets.remove(handle);
                }
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &mut [u8], scratch: &mut [u8]) {
        let Some(packet) = self.awg.deobfuscate(datagram) else {
            return;
        };

        match self.tunn.decapsulate(None, packet, scratch) {
            TunnResult::Done => {}
            TunnResult::Err(e) => tracing::debug!("Failed to decapsulate: {e:?}"),
            TunnResult::WriteToNetwork(wire) => {
                transmit(&self.socket, &self.awg, wire).await;

                // Flush packets queued while no session existed.
                while let TunnResult::WriteToNetwork(wire) =
                    self.tunn.decapsulate(None, &[], scratch)
                {
                    transmit(&self.socket, &self.awg, wire).await;
                }
            }
            TunnResult::WriteToTunnelV4(ip_packet, _) => self.device.receive(ip_packet.to_vec()),
            TunnResult::WriteToTunnelV6(..) => {
                tracing::trace!("Dropping IPv6 packet from tunnel");
            }
        }
    }

    async fn handle_tick(&mut self, scratch: &mut [u8]) {
        match self.tunn.update_timers(scratch) {
            TunnResult::Done => {}
            TunnResult::Err(WireGuardError::ConnectionExpired) => {
                tracing::warn!("WireGuard session expired");
                self.state.set(TunnelState::Error);
            }
            TunnResult::Err(e) => tracing::debug!("Timer error: {e:?}"),
            TunnResult::WriteToNetwork(wire) => transmit(&self.socket, &self.awg, wire).await,
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                debug_assert!(false, "timers cannot decrypt data")
            }
        }

        self.settle_handshake(true);

        // Expire dials that never established.
        let now = tokio::time::Instant::now();
        for (handle, bridge) in &mut self.streams {
            if bridge.connect.as_ref().is_some_and(|pc| now >= pc.deadline) {
                if let Some(pc) = bridge.connect.take() {
                    let _ = pc.reply.send(Err(ProviderError::DialTimeout(pc.dst)));
                }

                self.sockets.get_mut::<tcp::Socket>(*handle).abort();
            }
        }
    }

    fn settle_handshake(&mut self, check_deadline: bool) {
        let Some(pending) = self.pending_handshake.take() else {
            return;
        };

        if self.tunn.time_since_last_handshake().is_some() {
            let _ = pending.reply.send(Ok(()));
        } else if check_deadline && tokio::time::Instant::now() >= pending.deadline {
            let _ = pending.reply.send(Err(ProviderError::Handshake(
                "handshake timed out".to_owned(),
            )));
        } else {
            self.pending_handshake = Some(pending);
        }
    }

    /// Moves bytes between clients, smoltcp and the tunnel until quiescent.
    async fn pump(&mut self, scratch: &mut [u8]) {
        for _ in 0..MAX_PUMP_ITERS {
            self.flush_client_backlog();

            let poll_result =
                self.iface
                    .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);

            self.deliver_to_clients();

            let mut sent = false;
            while let Some(packet) = self.device.next_send() {
                sent = true;
                self.send_through_tunnel(&packet, scratch).await;
            }

            if matches!(poll_result, PollResult::None) && !sent {
                break;
            }
        }
    }

    fn flush_client_backlog(&mut self) {
        for (handle, bridge) in &mut self.streams {
            let socket = self.sockets.get_mut::<tcp::Socket>(*handle);

            while let Some(chunk) = bridge.pending.front() {
                if !socket.can_send() {
                    break;
                }

                match socket.send_slice(&chunk[bridge.pending_offset..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        bridge.pending_offset += n;

                        if bridge.pending_offset >= chunk.len() {
                            bridge.pending.pop_front();
                            bridge.pending_offset = 0;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(?handle, "Failed to write to socket: {e}");
                        bridge.pending.clear();
                        bridge.pending_offset = 0;
                        break;
                    }
                }
            }

            if bridge.client_closed && bridge.pending.is_empty() && socket.is_open() {
                socket.close();
            }
        }
    }

    fn deliver_to_clients(&mut self) {
        let mut defunct = Vec::new();

        for (handle, bridge) in &mut self.streams {
            let socket = self.sockets.get_mut::<tcp::Socket>(*handle);

            // Established: hand the stream over to the dialler.
            if socket.may_send()
                && let Some(pc) = bridge.connect.take()
            {
                if pc.reply.send(Ok(Box::new(pc.stream))).is_err() {
                    // Dialler gave up while we were connecting.
                    socket.abort();
                }
            }

            // Client dropped its stream without a clean shutdown.
            if bridge.connect.is_none()
                && bridge
                    .to_client
                    .as_ref()
                    .is_some_and(|to_client| to_client.is_closed())
            {
                bridge.to_client = None;
                bridge.client_closed = true;

                if socket.is_open() {
                    socket.close();
                }
            }

            if let Some(to_client) = &bridge.to_client {
                while socket.can_recv() {
                    if to_client.capacity() == 0 {
                        // Client is slow; bytes stay in the socket buffer and
                        // the window closes on its own.
                        break;
                    }

                    let mut chunk = vec![0u8; 4096];
                    match socket.recv_slice(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            chunk.truncate(n);
                            if to_client.try_send(chunk).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(?handle, "Failed to read from socket: {e}");
                            break;
                        }
                    }
                }

                // Remote closed its side and everything was drained: EOF.
                let remote_done = matches!(
                    socket.state(),
                    tcp::State::CloseWait
                        | tcp::State::Closing
                        | tcp::State::LastAck
                        | tcp::State::TimeWait
                        | tcp::State::Closed
                );
                if remote_done && !socket.can_recv() {
                    bridge.to_client = None;
                }
            }

            if socket.state() == tcp::State::Closed {
                if let Some(pc) = bridge.connect.take() {
                    let _ = pc.reply.send(Err(ProviderError::Io(std::io::Error::from(
                        std::io::ErrorKind::ConnectionRefused,
                    ))));
                }

                defunct.push(*handle);
            }
        }

        for handle in defunct {
            self.streams.remove(&handle);
            self.sockets.remove(handle);
        }

        let mut defunct_udp = Vec::new();

        for (handle, bridge) in &self.datagrams {
            let socket = self.sockets.get_mut::<udp::Socket>(*handle);

            while socket.can_recv() {
                if bridge.to_client.capacity() == 0 {
                    break;
                }

                let mut chunk = vec![0u8; 2048];
                match socket.recv_slice(&mut chunk) {
                    Ok((n, _)) => {
                        chunk.truncate(n);
                        let _ = bridge.to_client.try_send(chunk);
                    }
                    Err(e) => {
                        tracing::debug!(?handle, "Failed to receive datagram: {e}");
                        break;
                    }
                }
            }

            if bridge.to_client.is_closed() {
                defunct_udp.push(*handle);
            }
        }

        for handle in defunct_udp {
            self.datagrams.remove(&handle);
            self.sockets.remove(handle);
        }
    }

    async fn send_through_tunnel(&mut self, ip_packet: &[u8], scratch: &mut [u8]) {
        match self.tunn.encapsulate(ip_packet, scratch) {
            TunnResult::Done => {}
            TunnResult::Err(e) => tracing::debug!("Failed to encapsulate: {e:?}"),
            TunnResult::WriteToNetwork(wire) => transmit(&self.socket, &self.awg, wire).await,
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                debug_assert!(false, "encapsulation cannot decrypt data")
            }
        }
    }

    fn next_local_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = next_ephemeral_port(port);

        port
    }
}

/// Ephemeral ports cycle through the IANA dynamic range.
fn next_ephemeral_port(port: u16) -> u16 {
    if port == u16::MAX { 49152 } else { port + 1 }
}

async fn transmit(socket: &UdpSocket, awg: &AwgParams, packet: &mut [u8]) {
    let result = match awg.obfuscate(packet) {
        Obfuscated::InPlace(wire) => socket.send(wire).await,
        Obfuscated::Replaced(wire) => socket.send(&wire).await,
    };

    if let Err(e) = result {
        tracing::debug!("Failed to send to peer: {e}");
    }
}

fn make_interface(device: &mut InMemoryDevice, address: Ipv4Addr) -> Interface {
    let mut interface = Interface::new(
        Config::new(HardwareAddress::Ip),
        device,
        SmolInstant::now(),
    );

    // The device is entirely backed by in-memory buffers; accept whatever
    // shows up and route everything back out of the single interface.
    interface.set_any_ip(true);

    interface.update_ip_addrs(|ips| {
        ips.push(IpCidr::new(IpAddress::from(address), 32))
            .expect("should be a valid IPv4 CIDR");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(address)
        .expect("IPv4 default route should fit");

    interface
}

/// An in-memory device for smoltcp, fed by the decrypted side of the tunnel.
#[derive(Debug)]
struct InMemoryDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl InMemoryDevice {
    fn new(mtu: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        }
    }

    fn receive(&mut self, packet: Vec<u8>) {
        self.inbound.push_back(packet);
    }

    fn next_send(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }
}

impl Device for InMemoryDevice {
    type RxToken<'a> = SmolRxToken;
    type TxToken<'a> = SmolTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmolInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let rx_token = SmolRxToken {
            packet: self.inbound.pop_front()?,
        };
        let tx_token = SmolTxToken {
            outbound: &mut self.outbound,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(SmolTxToken {
            outbound: &mut self.outbound,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        caps
    }
}

struct SmolRxToken {
    packet: Vec<u8>,
}

impl phy::RxToken for SmolRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}

struct SmolTxToken<'a> {
    outbound: &'a mut VecDeque<Vec<u8>>,
}

impl phy::TxToken for SmolTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.outbound.push_back(buf);

        result
    }
}

/// Client half of a dialled TCP stream.
struct WgStream {
    handle: SocketHandle,
    read_rx: mpsc::Receiver<Vec<u8>>,
    leftover: Option<(Vec<u8>, usize)>,
    write_tx: PollSender<(SocketHandle, ClientMsg)>,
    shutdown_sent: bool,
}

impl tokio::io::AsyncRead for WgStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some((chunk, offset)) = &mut self.leftover {
                let n = std::cmp::min(buf.remaining(), chunk.len() - *offset);
                buf.put_slice(&chunk[*offset..*offset + n]);
                *offset += n;

                if *offset >= chunk.len() {
                    self.leftover = None;
                }

                return Poll::Ready(Ok(()));
            }

            match self.read_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.leftover = Some((chunk, 0));
                }
                // Engine signalled EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl tokio::io::AsyncWrite for WgStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.write_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let handle = self.handle;
                if self
                    .write_tx
                    .send_item((handle, ClientMsg::Data(buf.to_vec())))
                    .is_err()
                {
                    return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
                }

                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        if self.shutdown_sent {
            return Poll::Ready(Ok(()));
        }

        match self.write_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let handle = self.handle;
                let _ = self.write_tx.send_item((handle, ClientMsg::Close));
                self.shutdown_sent = true;

                Poll::Ready(Ok(()))
            }
            // Engine is gone; nothing left to close.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client half of a dialled UDP flow.
struct WgDatagram {
    handle: SocketHandle,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    write_tx: mpsc::Sender<(SocketHandle, ClientMsg)>,
}

#[async_trait::async_trait]
impl DatagramTunnel for WgDatagram {
    async fn send(&self, payload: &[u8]) -> Result<(), ProviderError> {
        self.write_tx
            .send((self.handle, ClientMsg::Data(payload.to_vec())))
            .await
            .map_err(|_| ProviderError::NotConnected)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, ProviderError> {
        let chunk = self
            .read_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ProviderError::NotConnected)?;

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);

        Ok(n)
    }
}

impl Drop for WgDatagram {
    fn drop(&mut self) {
        let _ = self.write_tx.try_send((self.handle, ClientMsg::Close));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_queues_roundtrip() {
        let mut device = InMemoryDevice::new(1400);

        device.receive(vec![1, 2, 3]);
        assert_eq!(device.inbound.len(), 1);

        use phy::TxToken as _;
        let token = Device::transmit(&mut device, SmolInstant::now()).expect("tx token");
        token.consume(4, |buf| buf.copy_from_slice(&[9, 9, 9, 9]));

        assert_eq!(device.next_send(), Some(vec![9, 9, 9, 9]));
        assert_eq!(device.next_send(), None);
    }

    #[test]
    fn local_ports_wrap_around() {
        assert_eq!(next_ephemeral_port(49152), 49153);
        assert_eq!(next_ephemeral_port(u16::MAX), 49152);
    }
}
