//! The router callback must not allocate for packets whose shape it has
//! seen before. New connections may allocate (NAT entry, process cache);
//! everything after that is lookups, atomics and in-place rewrites.

use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eth_packet::make::{SegFlags, tcp_frame, udp_frame};
use packet_driver::{OutboundCallback, ProcessApi, ProcessLookupError, Verdict};
use parking_lot::Mutex;
use splitroute_datapath::{
    FlowTable, PacketRouter, ProcessLookup, RuleEngine, TunnelRegistry, clock::CoarseClock,
};
use splitroute_model::{
    FallbackAction, Rule, RulePriority, TransportProto, TunnelConfig, TunnelId, TunnelProto,
    TunnelState,
};

struct CountingAllocator;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static COUNTING: AtomicBool = AtomicBool::new(false);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if COUNTING.load(Ordering::Relaxed) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }

        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

struct StaticProcessApi {
    flows: Mutex<HashMap<(TransportProto, SocketAddrV4, SocketAddrV4), u32>>,
    path: PathBuf,
}

impl ProcessApi for StaticProcessApi {
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

    fn exe_path(&self, _pid: u32) -> Result<PathBuf, ProcessLookupError> {
        Ok(self.path.clone())
    }
}

#[test]
fn steady_state_packets_do_not_allocate() {
    let client: SocketAddrV4 = "10.0.0.7:54321".parse().unwrap();
    let server: SocketAddrV4 = "93.184.216.34:443".parse().unwrap();
    let dns_client: SocketAddrV4 = "10.0.0.7:50000".parse().unwrap();
    let dns_server: SocketAddrV4 = "8.8.8.8:53".parse().unwrap();

    let clock = CoarseClock::new();
    let flow = Arc::new(FlowTable::new(clock));
    let rules = Arc::new(RuleEngine::new());
    let registry = Arc::new(TunnelRegistry::new());

    let api = Arc::new(StaticProcessApi {
        flows: Mutex::new(HashMap::from([
            ((TransportProto::Tcp, client, server), 1337),
            ((TransportProto::Udp, dns_client, dns_server), 1337),
        ])),
        path: PathBuf::from(r"C:\tools\curl.exe"),
    });
    let process = Arc::new(ProcessLookup::new(api));

    registry
        .register(
            Arc::new(TunnelConfig {
                id: TunnelId::from("t1"),
                proto: TunnelProto::Socks5,
                name: String::new(),
                options: Default::default(),
            }),
            30002,
            30003,
        )
        .unwrap();
    registry
        .set_state(&TunnelId::from("t1"), TunnelState::Up, None)
        .unwrap();
    rules.set_active(&TunnelId::from("t1"), true);
    rules
        .set_rules(vec![Rule {
            pattern: "curl.exe".to_owned(),
            tunnel: Some(TunnelId::from("t1")),
            fallback: FallbackAction::AllowDirect,
            priority: RulePriority::Auto,
        }])
        .unwrap();
    flow.add_proxy_ports(30002, 30003);

    let router = PacketRouter::new(flow, rules, registry, process);

    // First packets commit the flows; these are allowed to allocate.
    let mut syn = tcp_frame(client, server, SegFlags::syn(), b"");
    assert_eq!(router.on_outbound(&mut syn), Verdict::Redirect);
    let mut query = udp_frame(dns_client, dns_server, b"query");
    assert_eq!(router.on_outbound(&mut query), Verdict::Redirect);

    // Pre-build every steady-state packet shape outside the counted region.
    let mut frames: Vec<(Vec<u8>, Verdict)> = Vec::new();
    for _ in 0..64 {
        // Mid-flow segment.
        frames.push((
            tcp_frame(client, server, SegFlags::ack(), b"payload"),
            Verdict::Redirect,
        ));
        // Proxy return.
        frames.push((
            tcp_frame(
                SocketAddrV4::new(*client.ip(), 30002),
                SocketAddrV4::new(*server.ip(), client.port()),
                SegFlags::ack(),
                b"response",
            ),
            Verdict::Redirect,
        ));
        // Follow-up datagram on the committed UDP flow.
        frames.push((udp_frame(dns_client, dns_server, b"query"), Verdict::Redirect));
        // Unrelated flow with no NAT entry and no SYN: passes untouched.
        frames.push((
            tcp_frame("10.0.0.9:40000".parse().unwrap(), server, SegFlags::ack(), b""),
            Verdict::Pass,
        ));
    }

    ALLOCATIONS.store(0, Ordering::Relaxed);
    COUNTING.store(true, Ordering::Relaxed);

    for (frame, expected) in &mut frames {
        assert_eq!(router.on_outbound(frame), *expected);
    }

    COUNTING.store(false, Ordering::Relaxed);

    assert_eq!(
        ALLOCATIONS.load(Ordering::Relaxed),
        0,
        "router allocated on the steady-state path"
    );
}
