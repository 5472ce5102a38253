//! Shared in-memory fakes for the OS boundary and the provider seam.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use packet_driver::{ProcessApi, ProcessLookupError, RouteError, RouteManager};
use parking_lot::Mutex;
use splitroute_model::{
    ConfigSnapshot, TransportProto, TunnelConfig, TunnelId, TunnelProto, TunnelState,
};
use splitroute_providers::{
    DatagramTunnel, EndpointProvider, ProviderError, ProviderFactory, TunnelProvider, TunnelStream,
};
use tokio_util::sync::CancellationToken;

use crate::controller::ConfigStore;
use crate::registry::TunnelRegistry;

type FlowKey = (TransportProto, SocketAddrV4, SocketAddrV4);

#[derive(Default)]
pub(crate) struct FakeProcessApi {
    flows: Mutex<HashMap<FlowKey, u32>>,
    paths: Mutex<HashMap<u32, PathBuf>>,
}

impl FakeProcessApi {
    pub(crate) fn add(&self, proto: TransportProto, src: &str, dst: &str, pid: u32, path: &str) {
        self.add_addrs(
            proto,
            src.parse().expect("valid src"),
            dst.parse().expect("valid dst"),
            pid,
            path,
        );
    }

    pub(crate) fn add_addrs(
        &self,
        proto: TransportProto,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        pid: u32,
        path: &str,
    ) {
        self.flows.lock().insert((proto, src, dst), pid);
        self.paths.lock().insert(pid, PathBuf::from(path));
    }

    pub(crate) fn clear(&self) {
        self.flows.lock().clear();
        self.paths.lock().clear();
    }
}

impl ProcessApi for FakeProcessApi {
    fn pid_for_flow(
        &self,
        proto: TransportProto,
        src: SocketAddrV4,
        dst: SocketAddrV4,
    ) -> Result<u32, ProcessLookupError> {
        self.flows
            .lock()
            .get(&(proto, src, dst))
            .copied()
            .ok_or(ProcessLookupError::NotFound)
    }

    fn exe_path(&self, pid: u32) -> Result<PathBuf, ProcessLookupError> {
        self.paths
            .lock()
            .get(&pid)
            .cloned()
            .ok_or(ProcessLookupError::Gone(pid))
    }
}

/// A provider that is always up and dials targets on the real stack.
/// Lets proxy tests forward to loopback echo servers.
pub(crate) struct DirectProvider {
    udp: bool,
}

impl Default for DirectProvider {
    fn default() -> Self {
        Self { udp: true }
    }
}

impl DirectProvider {
    pub(crate) fn without_udp() -> Self {
        Self { udp: false }
    }
}

#[async_trait]
impl TunnelProvider for DirectProvider {
    async fn connect(&self, _cancel: CancellationToken) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn dial_tcp(&self, dst: SocketAddrV4) -> Result<TunnelStream, ProviderError> {
        let stream = tokio::net::TcpStream::connect(SocketAddr::V4(dst)).await?;

        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, dst: SocketAddrV4) -> Result<Box<dyn DatagramTunnel>, ProviderError> {
        if !self.udp {
            return Err(ProviderError::UnsupportedUdp);
        }

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(SocketAddr::V4(dst)).await?;

        Ok(Box::new(SocketDatagram(socket)))
    }

    fn state(&self) -> TunnelState {
        TunnelState::Up
    }
}

pub(crate) struct SocketDatagram(tokio::net::UdpSocket);

#[async_trait]
impl DatagramTunnel for SocketDatagram {
    async fn send(&self, payload: &[u8]) -> Result<(), ProviderError> {
        self.0.send(payload).await?;

        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, ProviderError> {
        Ok(self.0.recv(buf).await?)
    }
}

pub(crate) fn register_up(registry: &TunnelRegistry, id: &str, tcp_port: u16, udp_port: u16) {
    registry
        .register(
            Arc::new(TunnelConfig {
                id: TunnelId::from(id),
                proto: TunnelProto::Socks5,
                name: String::new(),
                options: Default::default(),
            }),
            tcp_port,
            udp_port,
        )
        .expect("registration should succeed");
    registry
        .set_state(&TunnelId::from(id), TunnelState::Up, None)
        .expect("state transition should succeed");
}

/// Scriptable provider for controller tests.
pub(crate) struct FakeProvider {
    remaining_failures: AtomicU32,
    state: Mutex<TunnelState>,
    endpoint: Option<Ipv4Addr>,
}

impl FakeProvider {
    fn new(failures: u32, endpoint: Option<Ipv4Addr>) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            state: Mutex::new(TunnelState::Down),
            endpoint,
        }
    }
}

#[async_trait]
impl TunnelProvider for FakeProvider {
    async fn connect(&self, _cancel: CancellationToken) -> Result<(), ProviderError> {
        let fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if fail {
            *self.state.lock() = TunnelState::Error;
            return Err(ProviderError::Handshake("scripted failure".to_owned()));
        }

        *self.state.lock() = TunnelState::Up;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.state.lock() = TunnelState::Down;
    }

    async fn dial_tcp(&self, _dst: SocketAddrV4) -> Result<TunnelStream, ProviderError> {
        Err(ProviderError::NotConnected)
    }

    async fn dial_udp(
        &self,
        _dst: SocketAddrV4,
    ) -> Result<Box<dyn DatagramTunnel>, ProviderError> {
        Err(ProviderError::NotConnected)
    }

    fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    fn as_endpoint_provider(&self) -> Option<&dyn EndpointProvider> {
        self.endpoint.is_some().then_some(self)
    }
}

impl EndpointProvider for FakeProvider {
    fn endpoints(&self) -> Vec<Ipv4Addr> {
        self.endpoint.into_iter().collect()
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    fail_connects: AtomicU32,
    endpoint: Mutex<Option<Ipv4Addr>>,
    created: Mutex<HashMap<TunnelId, Arc<FakeProvider>>>,
}

impl FakeFactory {
    pub(crate) fn fail_connects(&self, failures: u32) {
        self.fail_connects.store(failures, Ordering::SeqCst);
    }

    pub(crate) fn set_endpoint(&self, endpoint: Ipv4Addr) {
        *self.endpoint.lock() = Some(endpoint);
    }
}

impl ProviderFactory for FakeFactory {
    fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>, ProviderError> {
        let provider = Arc::new(FakeProvider::new(
            self.fail_connects.load(Ordering::SeqCst),
            *self.endpoint.lock(),
        ));

        self.created
            .lock()
            .insert(config.id.clone(), Arc::clone(&provider));

        Ok(provider)
    }
}

#[derive(Default)]
pub(crate) struct FakeRouteManager {
    routes: Mutex<Vec<Ipv4Addr>>,
}

impl FakeRouteManager {
    pub(crate) fn contains(&self, dst: Ipv4Addr) -> bool {
        self.routes.lock().contains(&dst)
    }
}

impl RouteManager for FakeRouteManager {
    fn add_host_route(&self, dst: Ipv4Addr) -> Result<(), RouteError> {
        self.routes.lock().push(dst);

        Ok(())
    }

    fn remove_host_route(&self, dst: Ipv4Addr) -> Result<(), RouteError> {
        self.routes.lock().retain(|route| *route != dst);

        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConfigStore {
    snapshot: Mutex<ConfigSnapshot>,
    persisted: Mutex<Vec<TunnelId>>,
}

impl FakeConfigStore {
    pub(crate) fn set_snapshot(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub(crate) fn persisted(&self) -> Vec<TunnelId> {
        self.persisted.lock().clone()
    }
}

impl ConfigStore for FakeConfigStore {
    fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.lock().clone()
    }

    fn persist_active_set(&self, ids: &[TunnelId]) -> anyhow::Result<()> {
        *self.persisted.lock() = ids.to_vec();

        Ok(())
    }

    fn active_set(&self) -> Vec<TunnelId> {
        self.persisted.lock().clone()
    }
}
