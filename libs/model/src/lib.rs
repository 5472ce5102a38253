//! Domain types shared across the split-tunnel router.
//!
//! Everything in here is plain data: ids, states, config records and the
//! events we publish on state transitions. The crates that do actual work
//! (`splitroute-datapath`, `splitroute-providers`) all speak these types.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Identifier of a tunnel, unique within one [`ConfigSnapshot`].
///
/// The alphabet is application-defined; the only reserved value is
/// [`TunnelId::DIRECT`], which routes matching traffic through the real NIC
/// and is always considered active.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(String);

impl TunnelId {
    /// Sentinel id meaning "no tunnel, go direct".
    pub const DIRECT: &'static str = "__direct__";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn direct() -> Self {
        Self(Self::DIRECT.to_owned())
    }

    pub fn is_direct(&self) -> bool {
        self.0 == Self::DIRECT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelId({})", self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// The wire protocol a tunnel speaks.
///
/// The datapath never looks inside these; each variant maps to a provider
/// adapter in `splitroute-providers`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TunnelProto {
    Wireguard,
    AmneziaWg,
    Socks5,
    Http,
    Vless,
    /// The real NIC; only used by the reserved [`TunnelId::DIRECT`] entry.
    Direct,
}

/// Lifecycle state of a registered tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TunnelState {
    Down,
    Connecting,
    Up,
    Error,
}

/// Static description of a tunnel.
///
/// Immutable once registered; edits replace the config wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: TunnelId,
    pub proto: TunnelProto,
    #[serde(default)]
    pub name: String,
    /// Protocol-specific options, interpreted by the provider adapter.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TunnelConfig {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// What to do with a matched flow when its tunnel is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Let the flow out through the real NIC.
    #[default]
    AllowDirect,
    /// Drop the flow if the tunnel is gone or not up.
    Block,
    /// Drop the flow unconditionally. Rules with this action are firewall
    /// rules; they never tunnel.
    Drop,
    /// Continue scanning rules from the next index.
    Failover,
}

/// Scheduling hint attached to a rule, forwarded to the proxy pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    #[default]
    Auto,
    Realtime,
    Normal,
    Low,
}

/// One process-matching rule.
///
/// Pattern semantics (applied against the lowercased executable path):
/// `regex:<expr>` is a regular expression; a trailing `\*` or `/*` is a
/// directory prefix; anything containing a path separator is a full-path
/// glob; everything else matches the exe name exactly or as a substring of
/// the base name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    #[serde(default)]
    pub tunnel: Option<TunnelId>,
    #[serde(default)]
    pub fallback: FallbackAction,
    #[serde(default)]
    pub priority: RulePriority,
}

/// Transport protocol of a flow, as far as the datapath cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportProto {
    Tcp,
    Udp,
}

/// A driver-level block rule, applied at attach time.
///
/// These are opaque to the datapath; the packet driver collaborator turns
/// them into its own filter language (WFP rules, BPF, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GlobalFilter {
    /// Block all IPv6 so nothing escapes the IPv4-only datapath.
    BlockIpv6,
    /// Block UDP 443 so browsers fall back from QUIC to TCP.
    BlockQuic,
    /// Block an arbitrary protocol/port pair.
    BlockPort { proto: TransportProto, port: u16 },
}

/// The deserialized configuration the controller consumes.
///
/// Loading, schema migration and persistence formats live outside the core;
/// we only ever see the finished records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// DNS servers; interpreted by the DNS collaborator, ignored here.
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub global_filters: Vec<GlobalFilter>,
    /// Free-form per-subsystem settings maps.
    #[serde(default)]
    pub settings: BTreeMap<String, BTreeMap<String, String>>,
}

/// Published on every registry state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub tunnel_id: TunnelId,
    pub old_state: TunnelState,
    pub new_state: TunnelState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_sentinel_is_recognised() {
        assert!(TunnelId::direct().is_direct());
        assert!(TunnelId::from("__direct__").is_direct());
        assert!(!TunnelId::from("wg-de-1").is_direct());
    }

    #[test]
    fn proto_parses_from_config_string() {
        use std::str::FromStr as _;

        assert_eq!(
            TunnelProto::from_str("amnezia_wg").unwrap(),
            TunnelProto::AmneziaWg
        );
        assert_eq!(TunnelProto::from_str("socks5").unwrap(), TunnelProto::Socks5);
    }

    #[test]
    fn rule_defaults_fill_in() {
        let rule: Rule = serde_json::from_str(r#"{"pattern": "curl.exe"}"#).unwrap();

        assert_eq!(rule.tunnel, None);
        assert_eq!(rule.fallback, FallbackAction::AllowDirect);
        assert_eq!(rule.priority, RulePriority::Auto);
    }

    #[test]
    fn global_filter_roundtrips() {
        let json = r#"{"kind": "block_port", "proto": "udp", "port": 443}"#;
        let filter: GlobalFilter = serde_json::from_str(json).unwrap();

        assert_eq!(
            filter,
            GlobalFilter::BlockPort {
                proto: TransportProto::Udp,
                port: 443
            }
        );
    }
}
