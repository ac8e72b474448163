//! HTTP routing for the webhook and metrics servers.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::warn;

use super::admission::AdmissionHandler;
use crate::metrics::MetricsExporter;
use crate::tls::CertificateStore;

/// Create the webhook router
pub fn webhook_router(handler: Arc<AdmissionHandler>, path: &str, max_body_size: usize) -> Router {
    Router::new()
        .route(path, post(mutate_pod))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn mutate_pod(State(handler): State<Arc<AdmissionHandler>>, body: Bytes) -> Response {
    match handler.handle(&body).await {
        Ok(review) => Json(review).into_response(),
        Err(e) => {
            warn!(error = %e, "Rejecting malformed admission request");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// State of the metrics server
#[derive(Debug, Clone)]
pub struct MetricsState {
    /// Prometheus renderer, absent when metrics are disabled
    pub exporter: Option<MetricsExporter>,
    /// Consulted by the readiness probe
    pub store: Arc<CertificateStore>,
}

/// Create the metrics and probe router
pub fn metrics_router(state: MetricsState, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    match &state.exporter {
        Some(exporter) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            exporter.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<MetricsState>) -> Response {
    let cert_state = state.store.state();
    if state.store.is_ready() {
        (StatusCode::OK, cert_state.name()).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, cert_state.name()).into_response()
    }
}
