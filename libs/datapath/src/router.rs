//! The outbound packet callback.
//!
//! Installed into the packet driver's dispatch loop, possibly on several
//! worker threads at once. Everything it touches is thread-safe and the
//! steady-state path allocates nothing: parsing is in place, the NAT entry
//! comes back as an `Arc` clone, and header rewrites update checksums
//! incrementally.
//!
//! Anything unexpected degrades to [`Verdict::Pass`]; the one failure mode
//! a VPN router must not have is black-holing traffic it does not
//! understand. [`Verdict::Drop`] is reserved for explicit policy.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eth_packet::{EthFrame, PktMeta, TcpFlags, Transport};
use packet_driver::{OutboundCallback, Verdict};
use splitroute_model::{FallbackAction, TransportProto, TunnelId, TunnelState};

use crate::flow::{FlowTable, NatEntry, NatKey};
use crate::process::{ProcessInfo, ProcessLookup};
use crate::registry::TunnelRegistry;
use crate::rules::RuleEngine;

pub struct PacketRouter {
    flow: Arc<FlowTable>,
    rules: Arc<RuleEngine>,
    registry: Arc<TunnelRegistry>,
    process: Arc<ProcessLookup>,
    stats: RouterStats,
}

enum Decision {
    Pass,
    Drop,
    Redirect { proxy_port: u16, tunnel: TunnelId },
}

impl PacketRouter {
    pub fn new(
        flow: Arc<FlowTable>,
        rules: Arc<RuleEngine>,
        registry: Arc<TunnelRegistry>,
        process: Arc<ProcessLookup>,
    ) -> Self {
        Self {
            flow,
            rules,
            registry,
            process,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    fn route_tcp(&self, frame: &mut EthFrame<'_>, meta: &PktMeta, flags: TcpFlags) -> Verdict {
        let now = self.flow.clock().now();

        // Proxy → client response: reverse-rewrite so the client sees the
        // original server talking to it.
        if self.flow.is_tcp_proxy_port(meta.src_port) {
            let key = NatKey {
                dst_ip: meta.dst_ip,
                src_port: meta.dst_port,
            };

            let Some(entry) = self.flow.lookup_tcp(key) else {
                return Verdict::Pass;
            };

            entry.touch(now);
            if flags.rst() {
                self.flow.remove_tcp(key);
            }

            self.stats.proxy_returns.fetch_add(1, Ordering::Relaxed);
            rewrite_return(frame, &entry);

            return Verdict::Redirect;
        }

        if flags.syn() && !flags.ack() {
            // New connection: the only point where policy is evaluated.
            let src = SocketAddrV4::new(meta.src_ip, meta.src_port);
            let dst = SocketAddrV4::new(meta.dst_ip, meta.dst_port);

            let Ok(info) = self.process.lookup(TransportProto::Tcp, src, dst) else {
                return Verdict::Pass;
            };

            return match self.decide(&info, TransportProto::Tcp) {
                Decision::Pass => Verdict::Pass,
                Decision::Drop => Verdict::Drop,
                Decision::Redirect { proxy_port, tunnel } => {
                    let key = NatKey {
                        dst_ip: meta.dst_ip,
                        src_port: meta.src_port,
                    };
                    self.flow
                        .insert_tcp(key, NatEntry::new(now, dst, tunnel, proxy_port));

                    rewrite_redirect(frame, proxy_port);
                    Verdict::Redirect
                }
            };
        }

        // Packet on an existing flow.
        let key = NatKey {
            dst_ip: meta.dst_ip,
            src_port: meta.src_port,
        };

        let Some(entry) = self.flow.lookup_tcp(key) else {
            return Verdict::Pass;
        };

        entry.touch(now);
        // RST tears the mapping down immediately; FIN does not, so late
        // ACKs still get rewritten until the idle sweep.
        if flags.rst() {
            self.flow.remove_tcp(key);
        }

        rewrite_redirect(frame, entry.proxy_port);

        Verdict::Redirect
    }

    fn route_udp(&self, frame: &mut EthFrame<'_>, meta: &PktMeta) -> Verdict {
        let now = self.flow.clock().now();

        if self.flow.is_udp_proxy_port(meta.src_port) {
            let key = NatKey {
                dst_ip: meta.dst_ip,
                src_port: meta.dst_port,
            };

            let Some(entry) = self.flow.lookup_udp(key) else {
                return Verdict::Pass;
            };

            entry.touch(now);
            self.stats.proxy_returns.fetch_add(1, Ordering::Relaxed);
            rewrite_return(frame, &entry);

            return Verdict::Redirect;
        }

        // Discovery, mDNS, DHCP and friends stay on the real network.
        if meta.dst_ip.is_multicast() || meta.dst_ip.is_broadcast() {
            return Verdict::Pass;
        }

        let key = NatKey {
            dst_ip: meta.dst_ip,
            src_port: meta.src_port,
        };

        if let Some(entry) = self.flow.lookup_udp(key) {
            entry.touch(now);
            rewrite_redirect(frame, entry.proxy_port);

            return Verdict::Redirect;
        }

        // No entry: first packet of a new flow.
        let src = SocketAddrV4::new(meta.src_ip, meta.src_port);
        let dst = SocketAddrV4::new(meta.dst_ip, meta.dst_port);

        let Ok(info) = self.process.lookup(TransportProto::Udp, src, dst) else {
            return Verdict::Pass;
        };

        match self.decide(&info, TransportProto::Udp) {
            Decision::Pass => Verdict::Pass,
            Decision::Drop => Verdict::Drop,
            Decision::Redirect { proxy_port, tunnel } => {
                self.flow
                    .insert_udp(key, NatEntry::new(now, dst, tunnel, proxy_port));

                rewrite_redirect(frame, proxy_port);
                Verdict::Redirect
            }
        }
    }

    /// Maps a rule hit to a verdict, walking the failover chain if needed.
    fn decide(&self, info: &ProcessInfo, proto: TransportProto) -> Decision {
        let Some(mut hit) = self.rules.match_exe(&info.path_lower, &info.base_lower) else {
            return Decision::Pass;
        };

        loop {
            // `Drop` rules are firewall rules; they never tunnel.
            if hit.fallback == FallbackAction::Drop {
                return Decision::Drop;
            }

            let Some(tunnel) = hit.tunnel.clone() else {
                return Decision::Pass;
            };

            if tunnel.is_direct() {
                return Decision::Pass;
            }

            let Some(dial) = self.registry.dial_info(&tunnel) else {
                // Configured but never registered: only `Block` turns this
                // into a drop.
                return if hit.fallback == FallbackAction::Block {
                    Decision::Drop
                } else {
                    Decision::Pass
                };
            };

            if dial.state != TunnelState::Up {
                match hit.fallback {
                    FallbackAction::Block => return Decision::Drop,
                    FallbackAction::AllowDirect => return Decision::Pass,
                    FallbackAction::Drop => return Decision::Drop,
                    FallbackAction::Failover => {
                        match self
                            .rules
                            .match_from(&info.path_lower, &info.base_lower, hit.index + 1)
                        {
                            Some(next) => {
                                hit = next;
                                continue;
                            }
                            None => return Decision::Pass,
                        }
                    }
                }
            }

            let proxy_port = match proto {
                TransportProto::Tcp => dial.tcp_proxy_port,
                TransportProto::Udp => dial.udp_proxy_port,
            };

            return Decision::Redirect { proxy_port, tunnel };
        }
    }
}

impl OutboundCallback for PacketRouter {
    fn on_outbound(&self, frame: &mut [u8]) -> Verdict {
        let mut frame = match EthFrame::parse(frame) {
            Ok(frame) => frame,
            // Not ours to judge: IPv6, fragments, weird protocols and
            // truncated frames all go out unmodified.
            Err(_) => {
                self.stats.parse_skips.fetch_add(1, Ordering::Relaxed);
                return Verdict::Pass;
            }
        };

        let meta = frame.meta();

        let verdict = match meta.transport {
            Transport::Tcp(flags) => self.route_tcp(&mut frame, &meta, flags),
            Transport::Udp => self.route_udp(&mut frame, &meta),
        };

        self.stats.record(verdict);

        verdict
    }
}

/// Client → proxy: hairpin the packet back into the local stack.
fn rewrite_redirect(frame: &mut EthFrame<'_>, proxy_port: u16) {
    frame.swap_macs();
    frame.swap_ips();
    frame.set_dst_port(proxy_port);
}

/// Proxy → client: impersonate the original server.
fn rewrite_return(frame: &mut EthFrame<'_>, entry: &NatEntry) {
    frame.set_src_port(entry.original_dst_port);
    frame.swap_macs();
    frame.swap_ips();
    frame.set_src_ip(entry.original_dst_ip);
}

#[derive(Debug, Default)]
struct RouterStats {
    passed: AtomicU64,
    dropped: AtomicU64,
    redirected: AtomicU64,
    proxy_returns: AtomicU64,
    parse_skips: AtomicU64,
}

impl RouterStats {
    fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Pass => &self.passed,
            Verdict::Drop => &self.dropped,
            Verdict::Redirect => &self.redirected,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            passed: self.passed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            proxy_returns: self.proxy_returns.load(Ordering::Relaxed),
            parse_skips: self.parse_skips.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub passed: u64,
    pub dropped: u64,
    pub redirected: u64,
    pub proxy_returns: u64,
    pub parse_skips: u64,
}
