//! Flow-to-process resolution with a PID cache.
//!
//! The OS queries are comparatively expensive and the rule engine wants
//! pre-lowercased strings, so results are cached per PID with the lowering
//! done once. PIDs get reused; a background sweep re-queries every cached
//! PID and evicts entries that are gone or now name a different executable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use packet_driver::{ProcessApi, ProcessLookupError};
use splitroute_model::TransportProto;
use std::net::SocketAddrV4;
use tokio_util::sync::CancellationToken;

const REVALIDATE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub path: PathBuf,
    pub path_lower: String,
    pub base_lower: String,
}

impl ProcessInfo {
    fn new(pid: u32, path: PathBuf) -> Self {
        let path_lower = path.to_string_lossy().to_lowercase();
        let base_lower = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Self {
            pid,
            path,
            path_lower,
            base_lower,
        }
    }
}

pub struct ProcessLookup {
    api: Arc<dyn ProcessApi>,
    cache: DashMap<u32, Arc<ProcessInfo>>,
}

impl ProcessLookup {
    pub fn new(api: Arc<dyn ProcessApi>) -> Self {
        Self {
            api,
            cache: DashMap::new(),
        }
    }

    /// Resolves the process owning a 5-tuple.
    ///
    /// The hot path is one PID query plus one cache read; the executable
    /// path is only fetched (and lowered) on a cache miss.
    pub fn lookup(
        &self,
        proto: TransportProto,
        src: SocketAddrV4,
        dst: SocketAddrV4,
    ) -> Result<Arc<ProcessInfo>, ProcessLookupError> {
        let pid = self.api.pid_for_flow(proto, src, dst)?;

        if let Some(hit) = self.cache.get(&pid) {
            return Ok(Arc::clone(&hit));
        }

        let path = self.api.exe_path(pid)?;
        let info = Arc::new(ProcessInfo::new(pid, path));
        self.cache.insert(pid, Arc::clone(&info));

        tracing::debug!(pid, path = %info.path_lower, "Cached process");

        Ok(info)
    }

    /// Drops entries whose PID died or was reused by another executable.
    pub fn revalidate(&self) {
        self.cache.retain(|pid, info| {
            matches!(self.api.exe_path(*pid), Ok(path) if path == info.path)
        });
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn spawn_revalidate(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let lookup = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REVALIDATE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => lookup.revalidate(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeProcessApi {
        flows: Mutex<HashMap<(SocketAddrV4, SocketAddrV4), u32>>,
        paths: Mutex<HashMap<u32, PathBuf>>,
        path_queries: Mutex<u32>,
    }

    impl FakeProcessApi {
        fn with_process(self, pid: u32, path: &str, src: &str, dst: &str) -> Self {
            self.flows
                .lock()
                .insert((src.parse().unwrap(), dst.parse().unwrap()), pid);
            self.paths.lock().insert(pid, PathBuf::from(path));

            self
        }
    }

    impl ProcessApi for FakeProcessApi {
        fn pid_for_flow(
            &self,
            _proto: TransportProto,
            src: SocketAddrV4,
            dst: SocketAddrV4,
        ) -> Result<u32, ProcessLookupError> {
            self.flows
                .lock()
                .get(&(src, dst))
                .copied()
                .ok_or(ProcessLookupError::NotFound)
        }

        fn exe_path(&self, pid: u32) -> Result<PathBuf, ProcessLookupError> {
            *self.path_queries.lock() += 1;

            self.paths
                .lock()
                .get(&pid)
                .cloned()
                .ok_or(ProcessLookupError::Gone(pid))
        }
    }

    const SRC: &str = "10.0.0.7:54321";
    const DST: &str = "93.184.216.34:443";

    #[test]
    fn lowers_path_and_base_once() {
        let api = Arc::new(FakeProcessApi::default().with_process(
            1337,
            r"C:\Tools\Curl.EXE",
            SRC,
            DST,
        ));
        let lookup = ProcessLookup::new(api.clone());

        let info = lookup
            .lookup(TransportProto::Tcp, SRC.parse().unwrap(), DST.parse().unwrap())
            .unwrap();

        assert_eq!(info.path_lower, r"c:\tools\curl.exe");
        assert_eq!(info.base_lower, "curl.exe");

        // Second lookup is served from the cache.
        lookup
            .lookup(TransportProto::Tcp, SRC.parse().unwrap(), DST.parse().unwrap())
            .unwrap();
        assert_eq!(*api.path_queries.lock(), 1);
    }

    #[test]
    fn unknown_flow_is_not_found() {
        let lookup = ProcessLookup::new(Arc::new(FakeProcessApi::default()));

        let err = lookup
            .lookup(TransportProto::Udp, SRC.parse().unwrap(), DST.parse().unwrap())
            .unwrap_err();

        assert!(matches!(err, ProcessLookupError::NotFound));
    }

    #[test]
    fn revalidation_evicts_dead_and_reused_pids() {
        let api = Arc::new(
            FakeProcessApi::default()
                .with_process(1, r"c:\a.exe", SRC, DST)
                .with_process(2, r"c:\b.exe", "10.0.0.7:54322", DST),
        );
        let lookup = ProcessLookup::new(api.clone());

        lookup
            .lookup(TransportProto::Tcp, SRC.parse().unwrap(), DST.parse().unwrap())
            .unwrap();
        lookup
            .lookup(
                TransportProto::Tcp,
                "10.0.0.7:54322".parse().unwrap(),
                DST.parse().unwrap(),
            )
            .unwrap();
        assert_eq!(lookup.cached(), 2);

        // PID 1 exits, PID 2 is reused by a different binary.
        api.paths.lock().remove(&1);
        api.paths.lock().insert(2, PathBuf::from(r"c:\evil.exe"));

        lookup.revalidate();

        assert_eq!(lookup.cached(), 0);
    }
}
