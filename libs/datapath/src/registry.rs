//! Registry of known tunnels and their lifecycle state.
//!
//! Read-mostly: the router consults it on every new connection, writers
//! only show up when tunnels are added, removed or change state. Every
//! state transition is published to subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use splitroute_model::{TunnelConfig, TunnelEvent, TunnelId, TunnelProto, TunnelState};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tunnel `{0}` is already registered")]
    AlreadyRegistered(TunnelId),
    #[error("Port {0} is already in use by another tunnel")]
    PortInUse(u16),
    #[error("Unknown tunnel `{0}`")]
    UnknownTunnel(TunnelId),
}

#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub config: Arc<TunnelConfig>,
    pub state: TunnelState,
    pub tcp_proxy_port: u16,
    pub udp_proxy_port: u16,
    pub error: Option<String>,
}

/// The copy-only subset the router needs per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialInfo {
    pub state: TunnelState,
    pub tcp_proxy_port: u16,
    pub udp_proxy_port: u16,
}

pub struct TunnelRegistry {
    entries: RwLock<HashMap<TunnelId, TunnelEntry>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let registry = Self {
            entries: RwLock::new(HashMap::new()),
            events,
        };

        // The direct sentinel is an ordinary entry whose `Up` is pinned, so
        // nothing downstream needs to special-case its activeness.
        registry.entries.write().insert(
            TunnelId::direct(),
            TunnelEntry {
                config: Arc::new(TunnelConfig {
                    id: TunnelId::direct(),
                    proto: TunnelProto::Direct,
                    name: "Direct".to_owned(),
                    options: Default::default(),
                }),
                state: TunnelState::Up,
                tcp_proxy_port: 0,
                udp_proxy_port: 0,
                error: None,
            },
        );

        registry
    }

    pub fn register(
        &self,
        config: Arc<TunnelConfig>,
        tcp_proxy_port: u16,
        udp_proxy_port: u16,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();

        if entries.contains_key(&config.id) {
            return Err(RegistryError::AlreadyRegistered(config.id.clone()));
        }

        for entry in entries.values() {
            for port in [tcp_proxy_port, udp_proxy_port] {
                if port != 0 && (entry.tcp_proxy_port == port || entry.udp_proxy_port == port) {
                    return Err(RegistryError::PortInUse(port));
                }
            }
        }

        entries.insert(
            config.id.clone(),
            TunnelEntry {
                config,
                state: TunnelState::Down,
                tcp_proxy_port,
                udp_proxy_port,
                error: None,
            },
        );

        Ok(())
    }

    pub fn unregister(&self, id: &TunnelId) -> Result<(), RegistryError> {
        if id.is_direct() {
            return Ok(());
        }

        self.entries
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownTunnel(id.clone()))
    }

    pub fn get(&self, id: &TunnelId) -> Option<TunnelEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn state(&self, id: &TunnelId) -> Option<TunnelState> {
        self.entries.read().get(id).map(|entry| entry.state)
    }

    /// Allocation-free snapshot for the packet path.
    pub fn dial_info(&self, id: &TunnelId) -> Option<DialInfo> {
        self.entries.read().get(id).map(|entry| DialInfo {
            state: entry.state,
            tcp_proxy_port: entry.tcp_proxy_port,
            udp_proxy_port: entry.udp_proxy_port,
        })
    }

    /// Transitions a tunnel and publishes the change. Returns the previous
    /// state. The direct sentinel never transitions.
    pub fn set_state(
        &self,
        id: &TunnelId,
        new_state: TunnelState,
        error: Option<String>,
    ) -> Result<TunnelState, RegistryError> {
        if id.is_direct() {
            return Ok(TunnelState::Up);
        }

        let old_state = {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownTunnel(id.clone()))?;

            let old_state = entry.state;
            entry.state = new_state;
            entry.error = error;

            old_state
        };

        if old_state != new_state {
            tracing::info!(tunnel = %id, %old_state, %new_state, "Tunnel state changed");

            let _ = self.events.send(TunnelEvent {
                tunnel_id: id.clone(),
                old_state,
                new_state,
            });
        }

        Ok(old_state)
    }

    pub fn all(&self) -> Vec<TunnelEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> Arc<TunnelConfig> {
        Arc::new(TunnelConfig {
            id: TunnelId::from(id),
            proto: TunnelProto::Socks5,
            name: String::new(),
            options: Default::default(),
        })
    }

    #[test]
    fn direct_is_always_up() {
        let registry = TunnelRegistry::new();

        let entry = registry.get(&TunnelId::direct()).expect("direct exists");
        assert_eq!(entry.state, TunnelState::Up);

        // Pinned: transitions are ignored.
        registry
            .set_state(&TunnelId::direct(), TunnelState::Down, None)
            .unwrap();
        assert_eq!(registry.state(&TunnelId::direct()), Some(TunnelState::Up));
    }

    #[test]
    fn register_rejects_duplicate_ids_and_ports() {
        let registry = TunnelRegistry::new();

        registry.register(config("t1"), 30000, 30001).unwrap();

        assert_eq!(
            registry.register(config("t1"), 30002, 30003),
            Err(RegistryError::AlreadyRegistered(TunnelId::from("t1")))
        );
        assert_eq!(
            registry.register(config("t2"), 30001, 30004),
            Err(RegistryError::PortInUse(30001))
        );

        // Unregister releases the ports.
        registry.unregister(&TunnelId::from("t1")).unwrap();
        registry.register(config("t2"), 30000, 30001).unwrap();
    }

    #[test]
    fn set_state_returns_old_and_publishes() {
        let registry = TunnelRegistry::new();
        registry.register(config("t1"), 30000, 30001).unwrap();
        let mut events = registry.subscribe();

        let old = registry
            .set_state(&TunnelId::from("t1"), TunnelState::Connecting, None)
            .unwrap();
        assert_eq!(old, TunnelState::Down);

        let old = registry
            .set_state(&TunnelId::from("t1"), TunnelState::Up, None)
            .unwrap();
        assert_eq!(old, TunnelState::Connecting);

        let event = events.try_recv().unwrap();
        assert_eq!(event.old_state, TunnelState::Down);
        assert_eq!(event.new_state, TunnelState::Connecting);

        let event = events.try_recv().unwrap();
        assert_eq!(event.new_state, TunnelState::Up);
    }

    #[test]
    fn same_state_transition_is_not_published() {
        let registry = TunnelRegistry::new();
        registry.register(config("t1"), 30000, 30001).unwrap();
        let mut events = registry.subscribe();

        registry
            .set_state(&TunnelId::from("t1"), TunnelState::Down, None)
            .unwrap();

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn error_state_carries_message() {
        let registry = TunnelRegistry::new();
        registry.register(config("t1"), 30000, 30001).unwrap();

        registry
            .set_state(
                &TunnelId::from("t1"),
                TunnelState::Error,
                Some("handshake timed out".to_owned()),
            )
            .unwrap();

        let entry = registry.get(&TunnelId::from("t1")).unwrap();
        assert_eq!(entry.state, TunnelState::Error);
        assert_eq!(entry.error.as_deref(), Some("handshake timed out"));
    }

    #[test]
    fn dial_info_is_a_copy() {
        let registry = TunnelRegistry::new();
        registry.register(config("t1"), 30002, 30003).unwrap();

        let info = registry.dial_info(&TunnelId::from("t1")).unwrap();

        assert_eq!(
            info,
            DialInfo {
                state: TunnelState::Down,
                tcp_proxy_port: 30002,
                udp_proxy_port: 30003,
            }
        );
    }
}
