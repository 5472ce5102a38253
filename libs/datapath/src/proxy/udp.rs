//! The per-tunnel UDP hairpin proxy.
//!
//! Unlike TCP there is nothing to accept; sessions are keyed by the sender
//! address of arriving datagrams and live until idle. Each session owns one
//! provider-side datagram flow to the original destination.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use dashmap::DashMap;
use splitroute_model::TunnelState;
use splitroute_providers::DatagramTunnel;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DIAL_TIMEOUT, ProxyContext, UDP_DNS_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT};
use crate::flow::{DNS_PORT, NatKey};

const MAX_DATAGRAM: usize = 64 * 1024;
const SESSION_QUEUE: usize = 64;
/// Bursty flows (QUIC, streaming) overflow the default OS buffer quickly.
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

pub struct UdpProxy {
    socket: Arc<UdpSocket>,
    ctx: ProxyContext,
    cancel: CancellationToken,
    sessions: Arc<DashMap<SocketAddr, Session>>,
}

struct Session {
    to_tunnel: mpsc::Sender<Vec<u8>>,
}

impl UdpProxy {
    pub async fn bind(
        port: u16,
        ctx: ProxyContext,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(make_udp_socket(port)?);

        tracing::debug!(port, "UDP hairpin proxy listening");

        Ok(Self {
            socket,
            ctx,
            cancel,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (n, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!("Failed to receive hairpinned datagram: {e}");
                        continue;
                    }
                }
            };

            let datagram = buf[..n].to_vec();

            if let Some(session) = self.sessions.get(&peer) {
                // Full queue: the flow is outpacing the tunnel, drop.
                let _ = session.to_tunnel.try_send(datagram);
                continue;
            }

            if let Err(e) = self.open_session(peer, datagram) {
                tracing::debug!(%peer, "Dropping datagram: {e:#}");
            }
        }
    }

    fn open_session(&self, peer: SocketAddr, first_datagram: Vec<u8>) -> Result<()> {
        let SocketAddr::V4(peer_v4) = peer else {
            bail!("IPv6 peer on hairpin socket")
        };

        let Some(entry) = self.ctx.flow.lookup_udp(NatKey::from_client(peer_v4)) else {
            bail!("stray datagram, no committed flow for {peer}")
        };

        let tunnel_id = entry.tunnel_id.clone();
        let dst = entry.original_dst();

        if self.ctx.registry.state(&tunnel_id) != Some(TunnelState::Up) {
            bail!("tunnel `{tunnel_id}` is not up")
        }

        let provider = self
            .ctx
            .providers
            .get(&tunnel_id)
            .with_context(|| format!("no provider for tunnel `{tunnel_id}`"))?;

        let (to_tunnel, from_client) = mpsc::channel(SESSION_QUEUE);
        to_tunnel
            .try_send(first_datagram)
            .ok()
            .context("session queue full on first datagram")?;

        self.sessions.insert(peer, Session { to_tunnel });

        let socket = Arc::clone(&self.socket);
        let sessions = Arc::clone(&self.sessions);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            if let Err(e) = run_session(&socket, peer, dst, provider, from_client, cancel).await {
                tracing::debug!(%peer, %dst, "UDP session ended: {e:#}");
            }

            sessions.remove(&peer);
        });

        Ok(())
    }
}

fn make_udp_socket(port: u16) -> std::io::Result<UdpSocket> {
    let addr = socket2::SockAddr::from(std::net::SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;

    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr)?;

    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

enum SessionEvent {
    Cancelled,
    FromClient(Option<Vec<u8>>),
    FromTunnel(Result<usize, splitroute_providers::ProviderError>),
}

async fn run_session(
    socket: &UdpSocket,
    peer: SocketAddr,
    dst: std::net::SocketAddrV4,
    provider: Arc<dyn splitroute_providers::TunnelProvider>,
    mut from_client: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<()> {
    // `UnsupportedUdp` lands here: the session dies and the flow with it.
    let tunnel: Box<dyn DatagramTunnel> = tokio::time::timeout(DIAL_TIMEOUT, provider.dial_udp(dst))
        .await
        .with_context(|| format!("dial to {dst} timed out"))?
        .with_context(|| format!("failed to open datagram flow to {dst}"))?;

    let idle = if dst.port() == DNS_PORT {
        UDP_DNS_IDLE_TIMEOUT
    } else {
        UDP_IDLE_TIMEOUT
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let step: Result<SessionEvent, tokio::time::error::Elapsed> =
            tokio::time::timeout(idle, async {
                tokio::select! {
                    _ = cancel.cancelled() => SessionEvent::Cancelled,
                    data = from_client.recv() => SessionEvent::FromClient(data),
                    result = tunnel.recv(&mut buf) => SessionEvent::FromTunnel(result),
                }
            })
            .await;

        match step {
            // Idle: the session evaporates; NAT expiry is independent.
            Err(_) => break,
            Ok(SessionEvent::Cancelled) => break,
            Ok(SessionEvent::FromClient(None)) => break,
            Ok(SessionEvent::FromClient(Some(data))) => {
                tunnel
                    .send(&data)
                    .await
                    .context("failed to forward datagram")?;
            }
            Ok(SessionEvent::FromTunnel(result)) => {
                let n = result.context("failed to receive from tunnel")?;

                socket
                    .send_to(&buf[..n], peer)
                    .await
                    .context("failed to relay datagram to client")?;
            }
        }
    }

    Ok(())
}
