//! Contracts between the datapath and the operating system.
//!
//! The core never talks to WFP, TUN adapters or the route table directly.
//! Instead it is handed implementations of these traits. That keeps the
//! datapath OS-agnostic and lets tests drive it with in-memory fakes.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use splitroute_model::{GlobalFilter, TransportProto};

/// What the driver should do with an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet out unmodified.
    Pass,
    /// Silently discard the packet.
    Drop,
    /// Re-inject the (now modified) packet into the outbound path.
    Redirect,
}

/// The outbound hook installed into the driver's dispatch loop.
///
/// The driver may invoke this from several worker threads at once; the
/// callback must be non-blocking and must not allocate on a steady-state
/// packet.
pub trait OutboundCallback: Send + Sync {
    fn on_outbound(&self, frame: &mut [u8]) -> Verdict;
}

impl<F> OutboundCallback for F
where
    F: Fn(&mut [u8]) -> Verdict + Send + Sync,
{
    fn on_outbound(&self, frame: &mut [u8]) -> Verdict {
        (self)(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    pub index: u32,
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("No NIC with index {0}")]
    UnknownNic(u32),
    #[error("Driver does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// NIC-level packet interception.
pub trait PacketDriver: Send + Sync {
    fn nics(&self) -> Result<Vec<NicInfo>, DriverError>;

    /// Installs `callback` as the outbound hook on the given NIC.
    fn attach(&self, nic_index: u32, callback: Arc<dyn OutboundCallback>)
    -> Result<(), DriverError>;

    /// Applies driver-level block rules (IPv6, QUIC, ...).
    fn apply_filters(&self, filters: &[GlobalFilter]) -> Result<(), DriverError>;

    fn detach(&self) -> Result<(), DriverError>;
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to modify host route for {dst}")]
pub struct RouteError {
    pub dst: Ipv4Addr,
    #[source]
    pub source: std::io::Error,
}

/// Host-route manipulation on the real NIC, used to bypass tunnel endpoints.
pub trait RouteManager: Send + Sync {
    fn add_host_route(&self, dst: Ipv4Addr) -> Result<(), RouteError>;
    fn remove_host_route(&self, dst: Ipv4Addr) -> Result<(), RouteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessLookupError {
    /// No process owns the flow (yet). Common for the very first packet of
    /// a connection whose socket table entry has not materialised.
    #[error("No process owns this flow")]
    NotFound,
    #[error("Process {0} has exited")]
    Gone(u32),
    #[error("OS query failed: {0}")]
    Os(String),
}

/// PID / executable resolution.
pub trait ProcessApi: Send + Sync {
    /// Returns the PID owning the given 5-tuple.
    fn pid_for_flow(
        &self,
        proto: TransportProto,
        src: SocketAddrV4,
        dst: SocketAddrV4,
    ) -> Result<u32, ProcessLookupError>;

    /// Returns the full executable path of `pid`.
    fn exe_path(&self, pid: u32) -> Result<PathBuf, ProcessLookupError>;
}
