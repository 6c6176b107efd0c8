//! Liveness probe for the watchdog itself: is the monitor loop still ticking.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::time::Clock;

/// Shared between the monitor, which pushes the deadline forward on every tick, and the
/// `/_liveness` handler, which compares it to now.
#[derive(Clone)]
pub struct MonitorProbe {
    healthy_until_ms: Arc<AtomicI64>,
    deadline: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl MonitorProbe {
    /// The monitor must tick at least once every `deadline`; it gets one full deadline
    /// after creation before the probe can fail.
    pub fn new(deadline: Duration, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let probe = Self {
            healthy_until_ms: Arc::new(AtomicI64::new(0)),
            deadline,
            clock,
        };
        probe.report_tick();
        probe
    }

    pub fn report_tick(&self) {
        let deadline_ms = i64::try_from(self.deadline.as_millis()).unwrap_or(i64::MAX);
        let until = self.clock.now_ms().saturating_add(deadline_ms);
        self.healthy_until_ms.store(until, Ordering::Relaxed);
    }

    pub fn check(&self) -> ProbeStatus {
        let until = self.healthy_until_ms.load(Ordering::Relaxed);
        ProbeStatus {
            healthy: self.clock.now_ms() < until,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    pub healthy: bool,
}

impl IntoResponse for ProbeStatus {
    fn into_response(self) -> Response {
        match self.healthy {
            true => (StatusCode::OK, "ok"),
            false => (StatusCode::INTERNAL_SERVER_ERROR, "monitor stalled"),
        }
        .into_response()
    }
}
