//! The shared liveness clock: when did the monitored process last check in.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::time::Clock;

/// Cheap, cloneable write side of the liveness clock, handed to the HTTP layer.
///
/// The last-seen time is a single `AtomicI64` of epoch milliseconds, so concurrent
/// heartbeats and monitor reads never observe a torn value, and no lock is ever held
/// across an await point.
#[derive(Clone)]
pub struct HeartbeatHandle {
    last_seen_ms: Arc<AtomicI64>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl HeartbeatHandle {
    /// Record that the monitored process is alive as of now.
    ///
    /// Uses `fetch_max` so that two racing heartbeats cannot move the clock backwards:
    /// `last_seen` stays monotonically non-decreasing under a correct clock.
    pub fn record_heartbeat(&self) {
        let now = self.clock.now_ms();
        self.last_seen_ms.fetch_max(now, Ordering::AcqRel);
        metrics::counter!("stethoscope_heartbeats_total").increment(1);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Acquire)
    }

    /// Time since the last heartbeat. Zero if the clock went backwards.
    pub fn elapsed(&self) -> Duration {
        let gap = self.clock.now_ms().saturating_sub(self.last_seen_ms());
        Duration::from_millis(u64::try_from(gap).unwrap_or(0))
    }
}

/// A coherent view of the liveness state at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub alert_active: bool,
}

/// Liveness record owned by the monitor.
///
/// `alert_active` is only ever touched by its owner through `&mut self`, so it needs no
/// synchronization. Only the last-seen timestamp is shared, through [`HeartbeatHandle`].
pub struct LivenessState {
    heartbeat: HeartbeatHandle,
    alert_active: bool,
}

impl LivenessState {
    /// Create the state seeded with `last_seen = now`, so the first tick never fires.
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let now = clock.now_ms();
        Self {
            heartbeat: HeartbeatHandle {
                last_seen_ms: Arc::new(AtomicI64::new(now)),
                clock,
            },
            alert_active: false,
        }
    }

    pub fn handle(&self) -> HeartbeatHandle {
        self.heartbeat.clone()
    }

    pub fn record_heartbeat(&self) {
        self.heartbeat.record_heartbeat()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            elapsed: self.heartbeat.elapsed(),
            alert_active: self.alert_active,
        }
    }

    pub fn set_alert_active(&mut self, active: bool) {
        self.alert_active = active;
    }
}
