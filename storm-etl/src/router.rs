use axum::Router;
use common_metrics::setup_metrics_routes;
use health::{health_router, ReadinessFlag};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

/// Operational endpoints: `/healthz`, `/readyz` and, with a recorder, `/metrics`.
pub fn router(readiness: ReadinessFlag, metrics: Option<PrometheusHandle>) -> Router {
    let router = health_router(readiness).layer(TraceLayer::new_for_http());

    match metrics {
        Some(handle) => setup_metrics_routes(router, handle),
        None => router,
    }
}
