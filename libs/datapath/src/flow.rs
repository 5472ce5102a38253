//! Sharded NAT tables for redirected flows.
//!
//! A key exists in a table if and only if the router has committed to
//! hairpin that flow. Lookups happen on every packet, inserts only on new
//! connections, so each table is split into 64 shards with short
//! reader-writer locks; `last_activity` lives in an atomic so touching an
//! entry needs no lock at all.
//!
//! The proxy-port sets answer "is this packet coming from one of our own
//! proxies" on every packet. They change only when tunnels come and go, so
//! readers get a copy-on-write snapshot and never synchronise.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use splitroute_model::TunnelId;
use tokio_util::sync::CancellationToken;

use crate::clock::CoarseClock;

pub const N_SHARDS: usize = 64;

/// TCP entries survive this much silence.
pub const TCP_IDLE_SECS: i64 = 300;
/// UDP entries survive this much silence, unless they are DNS.
pub const UDP_IDLE_SECS: i64 = 120;
/// DNS is strictly request/response; its flows die fast.
pub const UDP_DNS_IDLE_SECS: i64 = 10;
pub const DNS_PORT: u16 = 53;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// NAT key: `(original destination IP, client source port)`.
///
/// Both components survive the hairpin unchanged (the client's ephemeral
/// port is preserved by the rewrite and the proxy's peer address is exactly
/// `(original_dst_ip, src_port)`), so egress and proxy-return packets
/// compute the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatKey {
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
}

impl NatKey {
    /// The key as seen by a proxy: its peer address.
    pub fn from_client(client: SocketAddrV4) -> Self {
        Self {
            dst_ip: *client.ip(),
            src_port: client.port(),
        }
    }

    fn to_bytes(self) -> [u8; 6] {
        let ip = self.dst_ip.octets();
        let port = self.src_port.to_be_bytes();

        [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
    }

    fn shard_index(self) -> usize {
        fnv1a(&self.to_bytes()) as usize & (N_SHARDS - 1)
    }
}

#[inline]
fn fnv1a(bytes: &[u8; 6]) -> u32 {
    let mut hash = 0x811c_9dc5_u32;

    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }

    hash
}

#[derive(Debug)]
pub struct NatEntry {
    last_activity: AtomicI64,
    pub original_dst_ip: Ipv4Addr,
    pub original_dst_port: u16,
    pub tunnel_id: TunnelId,
    /// The hairpin port for this flow's protocol.
    pub proxy_port: u16,
}

impl NatEntry {
    pub fn new(
        now: i64,
        original_dst: SocketAddrV4,
        tunnel_id: TunnelId,
        proxy_port: u16,
    ) -> Self {
        Self {
            last_activity: AtomicI64::new(now),
            original_dst_ip: *original_dst.ip(),
            original_dst_port: original_dst.port(),
            tunnel_id,
            proxy_port,
        }
    }

    pub fn original_dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.original_dst_ip, self.original_dst_port)
    }

    /// Lock-free activity bump; called on every matching packet.
    #[inline]
    pub fn touch(&self, now: i64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

type Shard = RwLock<HashMap<NatKey, Arc<NatEntry>>>;

struct Table {
    shards: [Shard; N_SHARDS],
}

impl Table {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
        }
    }

    fn insert(&self, key: NatKey, entry: NatEntry) {
        self.shards[key.shard_index()]
            .write()
            .insert(key, Arc::new(entry));
    }

    fn lookup(&self, key: NatKey) -> Option<Arc<NatEntry>> {
        self.shards[key.shard_index()].read().get(&key).cloned()
    }

    fn remove(&self, key: NatKey) -> bool {
        self.shards[key.shard_index()].write().remove(&key).is_some()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Two-phase sweep: collect stale keys under the read lock, delete them
    /// under the write lock, re-checking in between so a concurrent `touch`
    /// wins.
    fn cleanup(&self, now: i64, idle_limit: impl Fn(&NatEntry) -> i64) -> usize {
        let mut removed = 0;

        for shard in &self.shards {
            let stale: Vec<NatKey> = shard
                .read()
                .iter()
                .filter(|(_, entry)| now - entry.last_activity() > idle_limit(entry))
                .map(|(key, _)| *key)
                .collect();

            if stale.is_empty() {
                continue;
            }

            let mut guard = shard.write();
            for key in stale {
                let still_stale = guard
                    .get(&key)
                    .is_some_and(|entry| now - entry.last_activity() > idle_limit(entry));

                if still_stale {
                    guard.remove(&key);
                    removed += 1;
                }
            }
        }

        removed
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub tcp_removed: usize,
    pub udp_removed: usize,
}

pub struct FlowTable {
    tcp: Table,
    udp: Table,

    tcp_proxy_ports: ArcSwap<HashSet<u16>>,
    udp_proxy_ports: ArcSwap<HashSet<u16>>,
    /// Serialises proxy-port writers; readers never take it.
    port_writers: Mutex<()>,

    clock: Arc<CoarseClock>,
}

impl FlowTable {
    pub fn new(clock: Arc<CoarseClock>) -> Self {
        Self {
            tcp: Table::new(),
            udp: Table::new(),
            tcp_proxy_ports: ArcSwap::from_pointee(HashSet::new()),
            udp_proxy_ports: ArcSwap::from_pointee(HashSet::new()),
            port_writers: Mutex::new(()),
            clock,
        }
    }

    pub fn clock(&self) -> &CoarseClock {
        &self.clock
    }

    pub fn insert_tcp(&self, key: NatKey, entry: NatEntry) {
        tracing::debug!(?key, tunnel = %entry.tunnel_id, proxy_port = entry.proxy_port, "New TCP NAT entry");
        self.tcp.insert(key, entry);
    }

    pub fn insert_udp(&self, key: NatKey, entry: NatEntry) {
        tracing::debug!(?key, tunnel = %entry.tunnel_id, proxy_port = entry.proxy_port, "New UDP NAT entry");
        self.udp.insert(key, entry);
    }

    pub fn lookup_tcp(&self, key: NatKey) -> Option<Arc<NatEntry>> {
        self.tcp.lookup(key)
    }

    pub fn lookup_udp(&self, key: NatKey) -> Option<Arc<NatEntry>> {
        self.udp.lookup(key)
    }

    pub fn remove_tcp(&self, key: NatKey) -> bool {
        let removed = self.tcp.remove(key);
        if removed {
            tracing::debug!(?key, "TCP NAT entry removed");
        }

        removed
    }

    pub fn remove_udp(&self, key: NatKey) -> bool {
        let removed = self.udp.remove(key);
        if removed {
            tracing::debug!(?key, "UDP NAT entry removed");
        }

        removed
    }

    /// Resolves a proxy's accepted peer address back to the flow.
    pub fn lookup_tcp_nat(&self, client: SocketAddrV4) -> Option<(SocketAddrV4, TunnelId)> {
        let entry = self.lookup_tcp(NatKey::from_client(client))?;

        Some((entry.original_dst(), entry.tunnel_id.clone()))
    }

    pub fn lookup_udp_nat(&self, client: SocketAddrV4) -> Option<(SocketAddrV4, TunnelId)> {
        let entry = self.lookup_udp(NatKey::from_client(client))?;

        Some((entry.original_dst(), entry.tunnel_id.clone()))
    }

    #[inline]
    pub fn is_tcp_proxy_port(&self, port: u16) -> bool {
        self.tcp_proxy_ports.load().contains(&port)
    }

    #[inline]
    pub fn is_udp_proxy_port(&self, port: u16) -> bool {
        self.udp_proxy_ports.load().contains(&port)
    }

    pub fn add_proxy_ports(&self, tcp_port: u16, udp_port: u16) {
        let _writer = self.port_writers.lock();

        let mut tcp = HashSet::clone(&self.tcp_proxy_ports.load());
        tcp.insert(tcp_port);
        self.tcp_proxy_ports.store(Arc::new(tcp));

        let mut udp = HashSet::clone(&self.udp_proxy_ports.load());
        udp.insert(udp_port);
        self.udp_proxy_ports.store(Arc::new(udp));
    }

    pub fn remove_proxy_ports(&self, tcp_port: u16, udp_port: u16) {
        let _writer = self.port_writers.lock();

        let mut tcp = HashSet::clone(&self.tcp_proxy_ports.load());
        tcp.remove(&tcp_port);
        self.tcp_proxy_ports.store(Arc::new(tcp));

        let mut udp = HashSet::clone(&self.udp_proxy_ports.load());
        udp.remove(&udp_port);
        self.udp_proxy_ports.store(Arc::new(udp));
    }

    /// `(tcp, udp)` live entry counts.
    pub fn entry_counts(&self) -> (usize, usize) {
        (self.tcp.len(), self.udp.len())
    }

    /// Expires idle entries. Runs from a 30 s tick.
    pub fn cleanup(&self) -> CleanupStats {
        let now = self.clock.now();

        let stats = CleanupStats {
            tcp_removed: self.tcp.cleanup(now, |_| TCP_IDLE_SECS),
            udp_removed: self.udp.cleanup(now, |entry| {
                if entry.original_dst_port == DNS_PORT {
                    UDP_DNS_IDLE_SECS
                } else {
                    UDP_IDLE_SECS
                }
            }),
        };

        if stats.tcp_removed > 0 || stats.udp_removed > 0 {
            tracing::debug!(
                tcp = stats.tcp_removed,
                udp = stats.udp_removed,
                "Expired idle NAT entries"
            );
        }

        stats
    }

    pub fn spawn_cleanup(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => { table.cleanup(); }
                }
            }
        })
    }
}
