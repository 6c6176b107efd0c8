use axum::extract::State;
use axum::http::StatusCode;
use tracing::{debug, warn};

use crate::notify::Notification;

use super::AppState;

/// Record a heartbeat. The body is ignored and callers are not authenticated.
pub async fn heartbeat(State(state): State<AppState>) -> (StatusCode, &'static str) {
    state.heartbeat.record_heartbeat();
    debug!("received heartbeat");
    (StatusCode::OK, "Received")
}

/// Notify every channel right away. This is a side channel: neither the liveness clock
/// nor the monitor's alert state is touched.
pub async fn explicit_alarm(State(state): State<AppState>) -> (StatusCode, &'static str) {
    warn!("received explicit alarm");
    metrics::counter!("stethoscope_explicit_alarms_total").increment(1);
    state.notifier.notify(&Notification::ExplicitAlarm).await;
    (StatusCode::OK, "Alarm received")
}
