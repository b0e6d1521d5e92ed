//! Router assembly. State is the shared [`Runtime`].

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use botweave::Runtime;

use crate::{bots, broadcasts, health, metrics_ep, preview, webhook};

pub type AppState = Arc<Runtime>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/pg", get(health::pg))
        .route("/health/db", get(health::pg))
        .route("/health/redis", get(health::redis))
        .route("/health/llm", get(health::llm))
        .route("/tg/:bot_id", post(webhook::ingest))
        .route("/preview/send", post(preview::send))
        .route("/bots", post(bots::create).get(bots::list))
        .route(
            "/bots/:id",
            get(bots::show).put(bots::update).delete(bots::remove),
        )
        .route("/bots/:id/spec", get(bots::get_spec).put(bots::put_spec))
        .route("/bots/:id/reload", post(bots::reload))
        .route("/bots/:id/validate", post(bots::validate))
        .route("/bots/:id/data", delete(bots::purge_data))
        .route("/bots/:id/broadcasts", post(broadcasts::create))
        .route("/bots/:id/broadcasts/:bid", get(broadcasts::show))
        .route("/metrics", get(metrics_ep::metrics))
        .with_state(state)
}
