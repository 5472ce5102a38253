//! Tunnel providers.
//!
//! A provider brings a single tunnel up and hands out connections through
//! it. The datapath only ever sees the [`TunnelProvider`] contract; each
//! wire protocol (WireGuard, AmneziaWG, SOCKS5, HTTP CONNECT, VLESS) is a
//! small adapter over its own stack, created through [`create`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod http;
mod registry;
mod socks5;
mod vless;
mod wireguard;

pub use http::HttpProxyProvider;
pub use registry::{DefaultFactory, create};
pub use socks5::Socks5Provider;
pub use vless::VlessProvider;
pub use wireguard::WireguardProvider;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use splitroute_model::{TunnelConfig, TunnelState};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// A byte stream whose reads and writes go through a tunnel.
pub type TunnelStream = Box<dyn AsyncStream>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncStream")
    }
}

/// A datagram flow through a tunnel, bound to one remote address.
#[async_trait]
pub trait DatagramTunnel: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<(), ProviderError>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, ProviderError>;
}

impl std::fmt::Debug for dyn DatagramTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DatagramTunnel")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Tunnel is not connected")]
    NotConnected,
    #[error("Provider does not support UDP")]
    UnsupportedUdp,
    #[error("Connect was cancelled")]
    Cancelled,
    #[error("Missing option `{0}`")]
    MissingOption(&'static str),
    #[error("Invalid option `{key}`: {reason}")]
    BadOption { key: &'static str, reason: String },
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out dialing {0}")]
    DialTimeout(SocketAddrV4),
    #[error("Unsupported protocol `{0}`")]
    UnsupportedProto(splitroute_model::TunnelProto),
    #[error(transparent)]
    Socks(#[from] tokio_socks::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The uniform contract every tunnel protocol satisfies.
///
/// Providers own their lifecycle state; the registry entry in the datapath
/// mirrors it but the provider's own [`TunnelProvider::state`] is
/// authoritative for dialability.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Brings the tunnel up.
    ///
    /// May block for seconds; cancelling the token must abort the attempt
    /// and tear down any partial state.
    async fn connect(&self, cancel: CancellationToken) -> Result<(), ProviderError>;

    /// Tears the tunnel down. Idempotent.
    async fn disconnect(&self);

    /// Opens a byte-stream connection to `dst` through the tunnel.
    async fn dial_tcp(&self, dst: SocketAddrV4) -> Result<TunnelStream, ProviderError>;

    /// Opens a datagram flow to `dst` through the tunnel.
    async fn dial_udp(&self, dst: SocketAddrV4) -> Result<Box<dyn DatagramTunnel>, ProviderError>;

    fn state(&self) -> TunnelState;

    /// The local VPN-side address, if the tunnel has one.
    fn adapter_ip(&self) -> Option<Ipv4Addr> {
        None
    }

    /// IP-level injection, for tunnels that carry raw packets.
    fn as_raw_forwarder(&self) -> Option<&dyn RawForwarder> {
        None
    }

    /// Remote server addresses, for endpoint bypass routes.
    fn as_endpoint_provider(&self) -> Option<&dyn EndpointProvider> {
        None
    }
}

/// Optional capability: inject a raw IPv4 packet into the tunnel stack,
/// bypassing the per-flow proxies. Used by a TUN-style collaborator.
pub trait RawForwarder: Send + Sync {
    fn forward_ipv4(&self, packet: &[u8]) -> Result<(), ProviderError>;
}

/// Optional capability: the remote server IPs this tunnel talks to, so the
/// route manager can install bypass host-routes through the real NIC.
pub trait EndpointProvider: Send + Sync {
    fn endpoints(&self) -> Vec<Ipv4Addr>;
}

/// Constructs providers from configs. The datapath controller takes this as
/// a seam so tests can inject in-memory providers.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>, ProviderError>;
}

/// Provider-internal state cell.
///
/// All adapters share the same tiny lifecycle bookkeeping.
#[derive(Debug)]
pub(crate) struct StateCell(parking_lot::Mutex<TunnelState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(parking_lot::Mutex::new(TunnelState::Down))
    }

    pub(crate) fn get(&self) -> TunnelState {
        *self.0.lock()
    }

    pub(crate) fn set(&self, state: TunnelState) {
        *self.0.lock() = state;
    }

    pub(crate) fn ensure_up(&self) -> Result<(), ProviderError> {
        if self.get() != TunnelState::Up {
            return Err(ProviderError::NotConnected);
        }

        Ok(())
    }
}
