use std::future::ready;
use std::sync::Arc;

use axum::{extract::State, routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::liveness::HeartbeatHandle;
use crate::metrics::track_metrics;
use crate::notify::Notifier;
use crate::probes::{MonitorProbe, ProbeStatus};

use super::endpoints;

#[derive(Clone)]
pub struct AppState {
    pub heartbeat: HeartbeatHandle,
    pub notifier: Arc<Notifier>,
    pub probe: MonitorProbe,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/heartbeat", routing::post(endpoints::heartbeat))
        .route("/explicit_alarm", routing::post(endpoints::explicit_alarm))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to, a global recorder does not play well with tests.
    match metrics {
        Some(recorder_handle) => router.route(
            "/metrics",
            routing::get(move || ready(recorder_handle.render())),
        ),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "stethoscope"
}

async fn liveness(State(state): State<AppState>) -> ProbeStatus {
    state.probe.check()
}
