pub mod payments;
pub mod webhook;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::get_metrics;
use crate::startup::AppState;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "payment-pipeline",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Not ready once the worker pool has begun shutting down.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.gateway.is_shut_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "workers": state.config.gateway.max_workers,
        })),
    )
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
