//! The per-tunnel TCP hairpin proxy.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use splitroute_model::TunnelState;
use splitroute_providers::TunnelStream;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::{COPY_BUFFER_SIZE, DIAL_TIMEOUT, ProxyContext, TCP_IDLE_TIMEOUT};
use crate::flow::NatKey;

pub struct TcpProxy {
    listener: TcpListener,
    ctx: ProxyContext,
    cancel: CancellationToken,
}

impl TcpProxy {
    pub async fn bind(
        port: u16,
        ctx: ProxyContext,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;

        tracing::debug!(port, "TCP hairpin proxy listening");

        Ok(Self {
            listener,
            ctx,
            cancel,
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = proxy_connection(stream, peer, &ctx).await {
                                tracing::debug!(%peer, "Hairpin connection ended: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept hairpin connection: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn proxy_connection(
    client: TcpStream,
    peer: SocketAddr,
    ctx: &ProxyContext,
) -> Result<()> {
    let SocketAddr::V4(peer) = peer else {
        bail!("IPv6 peer on hairpin listener")
    };

    // The peer address is the NAT key: the client's ephemeral port survives
    // the hairpin and the source IP was swapped to the original destination.
    let Some(entry) = ctx.flow.lookup_tcp(NatKey::from_client(peer)) else {
        bail!("stray connection, no committed flow for {peer}")
    };

    let tunnel_id = entry.tunnel_id.clone();
    let dst = entry.original_dst();

    if ctx.registry.state(&tunnel_id) != Some(TunnelState::Up) {
        bail!("tunnel `{tunnel_id}` is not up")
    }

    let provider = ctx
        .providers
        .get(&tunnel_id)
        .with_context(|| format!("no provider for tunnel `{tunnel_id}`"))?;

    let upstream = tokio::time::timeout(DIAL_TIMEOUT, provider.dial_tcp(dst))
        .await
        .with_context(|| format!("dial to {dst} timed out"))?
        .with_context(|| format!("failed to dial {dst} through `{tunnel_id}`"))?;

    client.set_nodelay(true).ok();

    tracing::debug!(%peer, %dst, tunnel = %tunnel_id, "Splicing hairpinned flow");
    splice(client, upstream).await;

    Ok(())
}

/// Copies both directions until either side closes or goes idle. Slow
/// readers throttle the peer naturally through the bounded buffer.
async fn splice(client: TcpStream, upstream: TunnelStream) {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    tokio::join!(
        copy_half(client_read, upstream_write),
        copy_half(upstream_read, client_write),
    );
}

async fn copy_half<R, W>(mut from: R, mut to: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match tokio::time::timeout(TCP_IDLE_TIMEOUT, from.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };

        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }

    let _ = to.shutdown().await;
}
