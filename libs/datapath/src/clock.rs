//! Cached wall clock.
//!
//! The packet callback must never hit the OS clock, so a background task
//! refreshes a shared seconds counter every 250 ms. NAT timeouts are
//! measured in tens of seconds, which makes that drift irrelevant.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct CoarseClock {
    secs: AtomicI64,
}

impl CoarseClock {
    pub fn new() -> Arc<Self> {
        let clock = Arc::new(Self {
            secs: AtomicI64::new(0),
        });
        clock.refresh();

        clock
    }

    /// Current Unix time in seconds, as of the last refresh.
    pub fn now(&self) -> i64 {
        self.secs.load(Ordering::Relaxed)
    }

    pub fn refresh(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        self.secs.store(now, Ordering::Relaxed);
    }

    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let clock = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => clock.refresh(),
                }
            }
        })
    }

    /// Pins the clock to a fixed value; tests drive expiry with this.
    #[cfg(test)]
    pub(crate) fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::Relaxed);
    }
}
