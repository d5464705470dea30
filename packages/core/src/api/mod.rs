//! HTTP surface.
//!
//! [`create_router`] assembles every route the binary serves. Integration
//! tests build the same router so they exercise exactly what `main.rs` runs.

pub mod notifications;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;

use crate::metrics::AppMetrics;
use notifications::{create_notifications_router, NotificationsState};

/// Prometheus text exposition content type.
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, [(header::CACHE_CONTROL, "no-store")], "ok")
}

/// `GET /metrics`: Prometheus scrape endpoint.
pub async fn render_metrics(State(metrics): State<Arc<AppMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Failed to render metrics: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics error").into_response()
        }
    }
}

/// Count and time every routed request, labelled by route template.
async fn track_http_metrics(
    State(metrics): State<Arc<AppMetrics>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let response = next.run(req).await;

    metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    metrics
        .http_request_duration
        .observe(started.elapsed().as_secs_f64());

    response
}

pub fn create_router(notifications: NotificationsState, metrics: Arc<AppMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(metrics.clone())
        .merge(create_notifications_router(notifications))
        .route_layer(middleware::from_fn_with_state(metrics, track_http_metrics))
        .layer(CorsLayer::permissive())
}
