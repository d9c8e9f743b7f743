//! # Metrics and Health Endpoint
//!
//! `GET /metrics` renders the Prometheus recorder, `GET /healthz` reports
//! liveness and `GET /readyz` reports whether bootstrap has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;

use sctl_core::leadership::LEADER_GAUGE;
use sctl_reconcile::coordinator::{RECONCILE_DURATION, RECONCILE_TOTAL};
use sctl_storage::sweeper::SWEEP_DELETED_COUNTER;

/// Shared state of the metrics endpoint.
#[derive(Clone)]
pub struct Telemetry {
    handle: PrometheusHandle,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Install the process-wide Prometheus recorder.
    ///
    /// Fails if a recorder is already installed.
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe();
        Ok(Self::from_handle(handle))
    }

    /// A recorder that is not installed globally. Renders nothing the
    /// process records; used when the global slot is taken.
    pub fn detached() -> Self {
        Self::from_handle(PrometheusBuilder::new().build_recorder().handle())
    }

    fn from_handle(handle: PrometheusHandle) -> Self {
        Self {
            handle,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip `/readyz` to 200.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Whether `/readyz` answers 200.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Router for the metrics address.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(render))
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

fn describe() {
    metrics::describe_counter!(RECONCILE_TOTAL, "Finished reconciliations by kind and outcome.");
    metrics::describe_histogram!(
        RECONCILE_DURATION,
        metrics::Unit::Seconds,
        "Duration of reconciliations by kind."
    );
    metrics::describe_counter!(SWEEP_DELETED_COUNTER, "Artifacts removed by retention sweeps.");
    metrics::describe_gauge!(LEADER_GAUGE, "1 while this instance holds leadership.");
}

async fn render(State(telemetry): State<Telemetry>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        telemetry.handle.render(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(telemetry): State<Telemetry>) -> impl IntoResponse {
    if telemetry.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let telemetry = Telemetry::detached();
        assert_eq!(get_body(telemetry.router(), "/healthz").await, (StatusCode::OK, "ok".into()));
    }

    #[tokio::test]
    async fn readyz_follows_bootstrap() {
        let telemetry = Telemetry::detached();
        let (status, _) = get_body(telemetry.router(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        telemetry.mark_ready();
        let (status, body) = get_body(telemetry.router(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");
    }

    #[tokio::test]
    async fn metrics_renders() {
        let telemetry = Telemetry::detached();
        let (status, _) = get_body(telemetry.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }
}
