//! The split-tunnel datapath.
//!
//! Outbound packets from selected processes are intercepted at the NIC,
//! matched against process rules and hairpinned through a loopback proxy
//! that forwards them over the chosen tunnel provider; everything else
//! passes untouched.
//!
//! [`PacketRouter`] is the per-packet decision point, [`FlowTable`] holds
//! the NAT state that makes the hairpin reversible, [`TunnelController`]
//! orchestrates providers and their [`proxy`] pairs. The OS specifics
//! (interception, routes, process lookup) come in through the traits of
//! `packet-driver`.
//!
//! A typical embedding wires it up like this:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use splitroute_datapath::*;
//! # fn embed(
//! #     driver: Arc<dyn packet_driver::PacketDriver>,
//! #     route_manager: Arc<dyn packet_driver::RouteManager>,
//! #     process_api: Arc<dyn packet_driver::ProcessApi>,
//! #     config_store: Arc<dyn ConfigStore>,
//! # ) -> anyhow::Result<()> {
//! let clock = clock::CoarseClock::new();
//! let flow = Arc::new(FlowTable::new(clock.clone()));
//! let rules = Arc::new(RuleEngine::new());
//! let registry = Arc::new(TunnelRegistry::new());
//! let process = Arc::new(ProcessLookup::new(process_api));
//! let providers = Arc::new(ProviderMap::new());
//!
//! let cancel = tokio_util::sync::CancellationToken::new();
//! clock.spawn_refresh(cancel.clone());
//! flow.spawn_cleanup(cancel.clone());
//! process.spawn_revalidate(cancel.clone());
//!
//! let router = Arc::new(PacketRouter::new(
//!     flow.clone(),
//!     rules.clone(),
//!     registry.clone(),
//!     process,
//! ));
//!
//! driver.apply_filters(&config_store.snapshot().global_filters)?;
//! driver.attach(0, router)?;
//!
//! let controller = Arc::new(TunnelController::new(
//!     registry,
//!     flow,
//!     rules,
//!     providers,
//!     Arc::new(splitroute_providers::DefaultFactory),
//!     route_manager,
//!     config_store,
//!     PROXY_PORT_BASE,
//! ));
//!
//! controller.spawn_reconnect();
//! controller.spawn_health_watch();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod clock;
mod controller;
mod flow;
mod process;
pub mod proxy;
mod registry;
mod router;
mod rules;
#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{ConfigStore, ControllerError, PROXY_PORT_BASE, TunnelController};
pub use flow::{
    CleanupStats, DNS_PORT, FlowTable, N_SHARDS, NatEntry, NatKey, TCP_IDLE_SECS,
    UDP_DNS_IDLE_SECS, UDP_IDLE_SECS,
};
pub use process::{ProcessInfo, ProcessLookup};
pub use registry::{DialInfo, RegistryError, TunnelEntry, TunnelRegistry};
pub use router::{PacketRouter, RouterStatsSnapshot};
pub use rules::{RuleEngine, RuleError, RuleMatch};

use std::sync::Arc;

use dashmap::DashMap;
use splitroute_model::TunnelId;
use splitroute_providers::TunnelProvider;

/// Live provider objects, shared between the controller (writer) and the
/// hairpin proxies (readers).
#[derive(Default)]
pub struct ProviderMap {
    inner: DashMap<TunnelId, Arc<dyn TunnelProvider>>,
}

impl ProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: TunnelId, provider: Arc<dyn TunnelProvider>) {
        self.inner.insert(id, provider);
    }

    pub fn get(&self, id: &TunnelId) -> Option<Arc<dyn TunnelProvider>> {
        self.inner.get(id).map(|provider| Arc::clone(&provider))
    }

    pub fn remove(&self, id: &TunnelId) {
        self.inner.remove(id);
    }

    pub fn all(&self) -> Vec<(TunnelId, Arc<dyn TunnelProvider>)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}
