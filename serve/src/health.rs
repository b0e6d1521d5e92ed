//! Health probes: process, Postgres, Redis, LLM.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::app::AppState;

pub async fn health() -> Response {
    Json(json!({"ok": true})).into_response()
}

fn probe(key: &str, ok: bool) -> Response {
    let mut body = serde_json::Map::new();
    body.insert(key.to_string(), serde_json::Value::Bool(ok));
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::Value::Object(body))).into_response()
}

pub async fn pg(State(runtime): State<AppState>) -> Response {
    probe("pg_ok", runtime.pg_ok().await)
}

pub async fn redis(State(runtime): State<AppState>) -> Response {
    probe("redis_ok", runtime.redis_ok().await)
}

pub async fn llm(State(runtime): State<AppState>) -> Response {
    probe("llm_ok", runtime.llm_ok())
}
