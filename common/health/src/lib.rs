use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::debug;

/// Health reporting for a single-loop consumer service.
///
/// Liveness and readiness are deliberately kept apart:
///   - liveness (`/healthz`) only says the process is up and serving HTTP,
///     it is always healthy once the router answers.
///   - readiness (`/readyz`) says the processing loop has completed at least
///     one full cycle. It latches: once ready, the process stays ready for
///     its whole lifetime. It signals "has ever made progress", not
///     "is currently healthy".
///
/// The readiness flag has exactly one writer (the processing loop) and any
/// number of readers (the probes). Readers may observe a stale value for a
/// short while, which the probes tolerate.
pub trait Readiness: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Latching readiness flag, cheap to clone and share between tasks.
#[derive(Clone, Debug, Default)]
pub struct ReadinessFlag {
    ready: Arc<AtomicBool>,
}

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the component as ready. Calling this more than once is a no-op.
    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::Release) {
            debug!("readiness flag latched");
        }
    }
}

impl Readiness for ReadinessFlag {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Ready,
    NotReady,
}

/// Probe answer, can be returned directly from an axum handler.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: ProbeStatus,
}

impl HealthStatus {
    pub fn liveness() -> Self {
        Self {
            status: ProbeStatus::Healthy,
        }
    }

    pub fn readiness(ready: bool) -> Self {
        let status = if ready {
            ProbeStatus::Ready
        } else {
            ProbeStatus::NotReady
        };
        Self { status }
    }
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code from the probe status,
    /// and echoes the status as a small JSON body.
    fn into_response(self) -> Response {
        let code = match self.status {
            ProbeStatus::Healthy | ProbeStatus::Ready => StatusCode::OK,
            ProbeStatus::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, Json(self)).into_response()
    }
}

/// Build a Router exposing `/healthz` and `/readyz` backed by `readiness`.
pub fn health_router<R>(readiness: R) -> Router
where
    R: Readiness + Clone + 'static,
{
    Router::new()
        .route("/healthz", get(|| async { HealthStatus::liveness() }))
        .route(
            "/readyz",
            get(move || {
                let ready = readiness.is_ready();
                async move { HealthStatus::readiness(ready) }
            }),
        )
}
