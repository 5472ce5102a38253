//! Hairpin proxies.
//!
//! One TCP listener and one UDP socket per tunnel, on loopback ports the
//! router rewrites redirected flows towards. The accepted peer address *is*
//! the NAT key, which is how a proxy finds out where a flow was originally
//! headed.

mod tcp;
mod udp;

pub use tcp::TcpProxy;
pub use udp::UdpProxy;

use std::sync::Arc;
use std::time::Duration;

use crate::ProviderMap;
use crate::flow::FlowTable;
use crate::registry::TunnelRegistry;

/// Bound on a provider dial; an accepted flow whose dial exceeds this is
/// closed and its NAT entry left to expire.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const UDP_DNS_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Everything a proxy needs to resolve and forward a flow.
#[derive(Clone)]
pub struct ProxyContext {
    pub flow: Arc<FlowTable>,
    pub registry: Arc<TunnelRegistry>,
    pub providers: Arc<ProviderMap>,
}
