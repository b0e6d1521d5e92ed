//! `GET /metrics` — Prometheus text exposition.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::app::AppState;

pub async fn metrics(State(runtime): State<AppState>) -> Response {
    if !runtime.settings.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        runtime.metrics.gather_text(),
    )
        .into_response()
}
