//! Tunnel lifecycle orchestration.
//!
//! The controller owns the `{provider, tcp proxy, udp proxy}` triple of
//! every tunnel and drives the add/connect/disconnect/remove choreography:
//! ports are allocated and registered before proxies start, proxies start
//! before a tunnel can come up, and the router only ever observes `Up`
//! after the provider finished connecting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use splitroute_model::{ConfigSnapshot, TunnelConfig, TunnelId, TunnelState};
use splitroute_providers::{ProviderError, ProviderFactory, TunnelProvider};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::ProviderMap;
use crate::flow::FlowTable;
use crate::proxy::{ProxyContext, TcpProxy, UdpProxy};
use crate::registry::{RegistryError, TunnelRegistry};
use crate::rules::{RuleEngine, RuleError};

/// First hairpin port handed out.
pub const PROXY_PORT_BASE: u16 = 30000;

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Where the controller reads config records from and persists the set of
/// tunnels that are supposed to be connected.
pub trait ConfigStore: Send + Sync {
    fn snapshot(&self) -> ConfigSnapshot;
    fn persist_active_set(&self, ids: &[TunnelId]) -> anyhow::Result<()>;
    fn active_set(&self) -> Vec<TunnelId>;
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("`{0}` is a reserved tunnel id")]
    ReservedId(TunnelId),
    #[error("Unknown tunnel `{0}`")]
    UnknownTunnel(TunnelId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Failed to start hairpin proxies")]
    Proxy(#[source] std::io::Error),
}

struct ProxyPair {
    cancel: CancellationToken,
    tcp_task: tokio::task::JoinHandle<()>,
    udp_task: tokio::task::JoinHandle<()>,
}

/// Serial allocator with a free list, so removed tunnels hand their ports
/// to the next registration.
struct PortAllocator {
    next: u16,
    free: Vec<u16>,
}

impl PortAllocator {
    fn new(base: u16) -> Self {
        Self {
            next: base,
            free: Vec::new(),
        }
    }

    fn allocate_pair(&mut self) -> (u16, u16) {
        (self.allocate(), self.allocate())
    }

    fn allocate(&mut self) -> u16 {
        self.free.pop().unwrap_or_else(|| {
            let port = self.next;
            self.next += 1;

            port
        })
    }

    fn release_pair(&mut self, tcp_port: u16, udp_port: u16) {
        self.free.push(udp_port);
        self.free.push(tcp_port);
    }
}

pub struct TunnelController {
    registry: Arc<TunnelRegistry>,
    flow: Arc<FlowTable>,
    rules: Arc<RuleEngine>,
    providers: Arc<ProviderMap>,
    factory: Arc<dyn ProviderFactory>,
    route_manager: Arc<dyn packet_driver::RouteManager>,
    config_store: Arc<dyn ConfigStore>,

    proxies: Mutex<HashMap<TunnelId, ProxyPair>>,
    ports: Mutex<PortAllocator>,
    /// In-flight connects, cancellable by disconnect/shutdown.
    connects: Mutex<HashMap<TunnelId, CancellationToken>>,
    cancel: CancellationToken,
}

impl TunnelController {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        flow: Arc<FlowTable>,
        rules: Arc<RuleEngine>,
        providers: Arc<ProviderMap>,
        factory: Arc<dyn ProviderFactory>,
        route_manager: Arc<dyn packet_driver::RouteManager>,
        config_store: Arc<dyn ConfigStore>,
        port_base: u16,
    ) -> Self {
        Self {
            registry,
            flow,
            rules,
            providers,
            factory,
            route_manager,
            config_store,
            proxies: Mutex::new(HashMap::new()),
            ports: Mutex::new(PortAllocator::new(port_base)),
            connects: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Loads rules and tunnels from the config store. Individual tunnel
    /// failures are logged, not fatal: one bad config must not take the
    /// others down.
    pub async fn apply_config(&self) -> Result<(), ControllerError> {
        let snapshot = self.config_store.snapshot();

        self.rules.set_rules(snapshot.rules)?;

        for config in snapshot.tunnels {
            let id = config.id.clone();

            if let Err(e) = self.add_tunnel(config).await {
                tracing::warn!(tunnel = %id, "Failed to add tunnel: {e}");
            }
        }

        Ok(())
    }

    pub async fn add_tunnel(&self, config: TunnelConfig) -> Result<(), ControllerError> {
        if config.id.is_direct() {
            return Err(ControllerError::ReservedId(config.id));
        }

        let config = Arc::new(config);
        let provider = self.factory.create(&config)?;

        let (tcp_port, udp_port) = self.ports.lock().allocate_pair();

        if let Err(e) = self.registry.register(Arc::clone(&config), tcp_port, udp_port) {
            self.ports.lock().release_pair(tcp_port, udp_port);
            return Err(e.into());
        }

        let ctx = ProxyContext {
            flow: Arc::clone(&self.flow),
            registry: Arc::clone(&self.registry),
            providers: Arc::clone(&self.providers),
        };
        let cancel = self.cancel.child_token();

        let proxies = async {
            let tcp_proxy = TcpProxy::bind(tcp_port, ctx.clone(), cancel.clone()).await?;
            let udp_proxy = UdpProxy::bind(udp_port, ctx, cancel.clone()).await?;

            std::io::Result::Ok((tcp_proxy, udp_proxy))
        };

        let (tcp_proxy, udp_proxy) = match proxies.await {
            Ok(proxies) => proxies,
            Err(e) => {
                let _ = self.registry.unregister(&config.id);
                self.ports.lock().release_pair(tcp_port, udp_port);

                return Err(ControllerError::Proxy(e));
            }
        };

        self.flow.add_proxy_ports(tcp_port, udp_port);
        self.providers.insert(config.id.clone(), provider);
        self.proxies.lock().insert(
            config.id.clone(),
            ProxyPair {
                cancel,
                tcp_task: tcp_proxy.spawn(),
                udp_task: udp_proxy.spawn(),
            },
        );

        tracing::info!(tunnel = %config.id, tcp_port, udp_port, "Tunnel added");

        Ok(())
    }

    pub async fn connect_tunnel(&self, id: &TunnelId) -> Result<(), ControllerError> {
        let provider = self
            .providers
            .get(id)
            .ok_or_else(|| ControllerError::UnknownTunnel(id.clone()))?;

        self.registry
            .set_state(id, TunnelState::Connecting, None)?;

        let token = self.cancel.child_token();
        self.connects.lock().insert(id.clone(), token.clone());

        let result = provider.connect(token).await;

        self.connects.lock().remove(id);

        match result {
            Ok(()) => {
                self.registry.set_state(id, TunnelState::Up, None)?;
                self.rules.set_active(id, true);
                self.install_bypass_routes(provider.as_ref());
                self.persist_active();

                Ok(())
            }
            Err(e @ ProviderError::Cancelled) => {
                self.registry.set_state(id, TunnelState::Down, None)?;

                Err(e.into())
            }
            Err(e) => {
                self.registry
                    .set_state(id, TunnelState::Error, Some(e.to_string()))?;

                Err(e.into())
            }
        }
    }

    /// Idempotent: disconnecting a tunnel that is already down is a no-op.
    pub async fn disconnect_tunnel(&self, id: &TunnelId) -> Result<(), ControllerError> {
        let provider = self
            .providers
            .get(id)
            .ok_or_else(|| ControllerError::UnknownTunnel(id.clone()))?;

        if let Some(token) = self.connects.lock().remove(id) {
            token.cancel();
        }

        provider.disconnect().await;
        self.remove_bypass_routes(provider.as_ref());
        self.rules.set_active(id, false);
        self.registry.set_state(id, TunnelState::Down, None)?;
        self.persist_active();

        Ok(())
    }

    pub async fn remove_tunnel(&self, id: &TunnelId) -> Result<(), ControllerError> {
        self.disconnect_tunnel(id).await?;

        if let Some(pair) = self.proxies.lock().remove(id) {
            pair.cancel.cancel();
            pair.tcp_task.abort();
            pair.udp_task.abort();
        }

        self.providers.remove(id);

        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ControllerError::UnknownTunnel(id.clone()))?;
        self.registry.unregister(id)?;

        self.flow
            .remove_proxy_ports(entry.tcp_proxy_port, entry.udp_proxy_port);
        self.ports
            .lock()
            .release_pair(entry.tcp_proxy_port, entry.udp_proxy_port);

        tracing::info!(tunnel = %id, "Tunnel removed");

        Ok(())
    }

    /// Configs are replaced wholesale: tear down, re-register (the free
    /// list hands back the same ports), reconnect if it was up.
    pub async fn update_tunnel(&self, config: TunnelConfig) -> Result<(), ControllerError> {
        let id = config.id.clone();
        let was_up = self.registry.state(&id) == Some(TunnelState::Up);

        self.remove_tunnel(&id).await?;
        self.add_tunnel(config).await?;

        if was_up {
            self.connect_tunnel(&id).await?;
        }

        Ok(())
    }

    /// Reconnects everything the config store remembers as active.
    pub async fn connect_persisted(&self) {
        let ids = self.config_store.active_set();

        join_all(ids.iter().map(|id| async move {
            if let Err(e) = self.connect_tunnel(id).await {
                tracing::warn!(tunnel = %id, "Failed to restore tunnel: {e}");
            }
        }))
        .await;
    }

    /// Cancels background work, disconnects all providers in parallel and
    /// stops every proxy. The packet driver is closed by the embedder.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let providers = self.providers.all();
        join_all(providers.iter().map(|(id, provider)| async move {
            provider.disconnect().await;
            let _ = self.registry.set_state(id, TunnelState::Down, None);
        }))
        .await;

        for (_, pair) in self.proxies.lock().drain() {
            pair.tcp_task.abort();
            pair.udp_task.abort();
        }
    }

    /// Watches the state-change stream and re-connects tunnels that fall
    /// into `Error`, with jittered exponential backoff.
    pub fn spawn_reconnect(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let mut events = self.registry.subscribe();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let retrying = Arc::new(dashmap::DashSet::new());

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Reconnect supervisor lagged behind events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if event.new_state != TunnelState::Error {
                    continue;
                }

                // One retry task per tunnel at a time.
                if !retrying.insert(event.tunnel_id.clone()) {
                    continue;
                }

                let controller = Arc::clone(&controller);
                let retrying = Arc::clone(&retrying);
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let id = event.tunnel_id;
                    retry_connect(&controller, &id, cancel).await;
                    retrying.remove(&id);
                });
            }
        })
    }

    /// Propagates asynchronous provider failures (e.g. an expired WireGuard
    /// session) into the registry, where the reconnect supervisor and the
    /// rule engine's live skip react to them.
    pub fn spawn_health_watch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                for (id, provider) in controller.providers.all() {
                    let provider_failed = provider.state() == TunnelState::Error;
                    let registry_up = controller.registry.state(&id) == Some(TunnelState::Up);

                    if provider_failed && registry_up {
                        controller.rules.set_active(&id, false);
                        let _ = controller.registry.set_state(
                            &id,
                            TunnelState::Error,
                            Some("provider reported failure".to_owned()),
                        );
                    }
                }
            }
        })
    }

    fn persist_active(&self) {
        let active: Vec<TunnelId> = self
            .registry
            .all()
            .into_iter()
            .filter(|entry| entry.state == TunnelState::Up && !entry.config.id.is_direct())
            .map(|entry| entry.config.id.clone())
            .collect();

        if let Err(e) = self.config_store.persist_active_set(&active) {
            tracing::warn!("Failed to persist active tunnel set: {e:#}");
        }
    }

    fn install_bypass_routes(&self, provider: &dyn TunnelProvider) {
        let Some(endpoints) = provider.as_endpoint_provider() else {
            return;
        };

        for endpoint in endpoints.endpoints() {
            if let Err(e) = self.route_manager.add_host_route(endpoint) {
                tracing::warn!(%endpoint, "Failed to install bypass route: {e}");
            }
        }
    }

    fn remove_bypass_routes(&self, provider: &dyn TunnelProvider) {
        let Some(endpoints) = provider.as_endpoint_provider() else {
            return;
        };

        for endpoint in endpoints.endpoints() {
            if let Err(e) = self.route_manager.remove_host_route(endpoint) {
                tracing::debug!(%endpoint, "Failed to remove bypass route: {e}");
            }
        }
    }
}

async fn retry_connect(controller: &TunnelController, id: &TunnelId, cancel: CancellationToken) {
    use backoff::backoff::Backoff as _;

    let mut backoff = backoff::ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let Some(delay) = backoff.next_backoff() else {
            break;
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        // A manual disconnect or removal ends the retry loop.
        if controller.registry.state(id) != Some(TunnelState::Error) {
            return;
        }

        tracing::info!(tunnel = %id, "Reconnecting after error");

        match controller.connect_tunnel(id).await {
            Ok(()) => return,
            Err(e) => tracing::debug!(tunnel = %id, "Reconnect attempt failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CoarseClock;
    use crate::testutil::{FakeConfigStore, FakeFactory, FakeRouteManager};
    use splitroute_model::TunnelProto;
    use std::net::Ipv4Addr;

    struct Fixture {
        controller: Arc<TunnelController>,
        registry: Arc<TunnelRegistry>,
        rules: Arc<RuleEngine>,
        flow: Arc<FlowTable>,
        factory: Arc<FakeFactory>,
        routes: Arc<FakeRouteManager>,
        config_store: Arc<FakeConfigStore>,
    }

    fn fixture(port_base: u16) -> Fixture {
        let registry = Arc::new(TunnelRegistry::new());
        let flow = Arc::new(FlowTable::new(CoarseClock::new()));
        let rules = Arc::new(RuleEngine::new());
        let providers = Arc::new(ProviderMap::new());
        let factory = Arc::new(FakeFactory::default());
        let routes = Arc::new(FakeRouteManager::default());
        let config_store = Arc::new(FakeConfigStore::default());

        let controller = Arc::new(TunnelController::new(
            Arc::clone(&registry),
            Arc::clone(&flow),
            Arc::clone(&rules),
            providers,
            factory.clone(),
            routes.clone(),
            config_store.clone(),
            port_base,
        ));

        Fixture {
            controller,
            registry,
            rules,
            flow,
            factory,
            routes,
            config_store,
        }
    }

    fn config(id: &str) -> TunnelConfig {
        TunnelConfig {
            id: TunnelId::from(id),
            proto: TunnelProto::Socks5,
            name: String::new(),
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn add_tunnel_allocates_ports_and_registers() {
        let f = fixture(31000);

        f.controller.add_tunnel(config("t1")).await.unwrap();

        let entry = f.registry.get(&TunnelId::from("t1")).unwrap();
        assert_eq!(entry.state, TunnelState::Down);
        assert_eq!(entry.tcp_proxy_port, 31000);
        assert_eq!(entry.udp_proxy_port, 31001);
        assert!(f.flow.is_tcp_proxy_port(31000));
        assert!(f.flow.is_udp_proxy_port(31001));
    }

    #[tokio::test]
    async fn direct_id_is_reserved() {
        let f = fixture(31010);

        let err = f
            .controller
            .add_tunnel(config(TunnelId::DIRECT))
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::ReservedId(_)));
    }

    #[tokio::test]
    async fn duplicate_add_does_not_leak_ports() {
        let f = fixture(31020);

        f.controller.add_tunnel(config("t1")).await.unwrap();
        let err = f.controller.add_tunnel(config("t1")).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Registry(RegistryError::AlreadyRegistered(_))
        ));

        // The failed attempt's ports went back to the free list.
        f.controller.add_tunnel(config("t2")).await.unwrap();
        let entry = f.registry.get(&TunnelId::from("t2")).unwrap();
        assert_eq!(entry.tcp_proxy_port, 31022);
    }

    #[tokio::test]
    async fn connect_marks_up_and_installs_routes() {
        let f = fixture(31030);
        f.factory.set_endpoint(Ipv4Addr::new(203, 0, 113, 5));

        f.controller.add_tunnel(config("t1")).await.unwrap();
        f.controller
            .connect_tunnel(&TunnelId::from("t1"))
            .await
            .unwrap();

        assert_eq!(
            f.registry.state(&TunnelId::from("t1")),
            Some(TunnelState::Up)
        );
        assert!(f.rules.is_active(&TunnelId::from("t1")));
        assert!(f.routes.contains(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(f.config_store.persisted(), vec![TunnelId::from("t1")]);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_error_state() {
        let f = fixture(31040);
        f.factory.fail_connects(1);

        f.controller.add_tunnel(config("t1")).await.unwrap();
        let err = f.controller.connect_tunnel(&TunnelId::from("t1")).await;

        assert!(err.is_err());
        let entry = f.registry.get(&TunnelId::from("t1")).unwrap();
        assert_eq!(entry.state, TunnelState::Error);
        assert!(entry.error.is_some());
        assert!(!f.rules.is_active(&TunnelId::from("t1")));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let f = fixture(31050);

        f.controller.add_tunnel(config("t1")).await.unwrap();
        f.controller
            .connect_tunnel(&TunnelId::from("t1"))
            .await
            .unwrap();

        f.controller
            .disconnect_tunnel(&TunnelId::from("t1"))
            .await
            .unwrap();
        f.controller
            .disconnect_tunnel(&TunnelId::from("t1"))
            .await
            .unwrap();

        assert_eq!(
            f.registry.state(&TunnelId::from("t1")),
            Some(TunnelState::Down)
        );
        assert!(!f.rules.is_active(&TunnelId::from("t1")));
    }

    #[tokio::test]
    async fn remove_releases_ports_for_reuse() {
        let f = fixture(31060);

        f.controller.add_tunnel(config("t1")).await.unwrap();
        f.controller
            .remove_tunnel(&TunnelId::from("t1"))
            .await
            .unwrap();

        assert!(f.registry.get(&TunnelId::from("t1")).is_none());
        assert!(!f.flow.is_tcp_proxy_port(31060));

        // The freed pair is handed to the next tunnel.
        f.controller.add_tunnel(config("t2")).await.unwrap();
        let entry = f.registry.get(&TunnelId::from("t2")).unwrap();
        assert_eq!(
            (entry.tcp_proxy_port, entry.udp_proxy_port),
            (31060, 31061)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_supervisor_retries_errored_tunnels() {
        let f = fixture(31070);
        f.factory.fail_connects(2);

        f.controller.add_tunnel(config("t1")).await.unwrap();
        f.controller.spawn_reconnect();

        // First attempt fails and lands in Error.
        assert!(
            f.controller
                .connect_tunnel(&TunnelId::from("t1"))
                .await
                .is_err()
        );

        // The supervisor keeps retrying (second attempt fails, third works).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        loop {
            if f.registry.state(&TunnelId::from("t1")) == Some(TunnelState::Up) {
                break;
            }

            assert!(tokio::time::Instant::now() < deadline, "never reconnected");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    #[tokio::test]
    async fn apply_config_loads_rules_and_tunnels() {
        let f = fixture(31080);
        f.config_store.set_snapshot(ConfigSnapshot {
            tunnels: vec![config("t1"), config("t2")],
            rules: vec![splitroute_model::Rule {
                pattern: "curl.exe".to_owned(),
                tunnel: Some(TunnelId::from("t1")),
                fallback: Default::default(),
                priority: Default::default(),
            }],
            ..Default::default()
        });

        f.controller.apply_config().await.unwrap();

        assert!(f.registry.get(&TunnelId::from("t1")).is_some());
        assert!(f.registry.get(&TunnelId::from("t2")).is_some());
        assert_eq!(f.rules.rules().len(), 1);
    }
}
