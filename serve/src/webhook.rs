//! Webhook ingest: `POST /tg/{bot_id}`.
//!
//! Always answers 200 — delivery problems are the runtime's to record, not
//! Telegram's to retry. Replies go out through the runtime's outbound sender.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use botweave::Update;

use crate::app::AppState;

pub async fn ingest(
    State(runtime): State<AppState>,
    Path(bot_id): Path<String>,
    body: String,
) -> Response {
    let started = std::time::Instant::now();
    let ok = Json(json!({"ok": true}));

    // 200 always, even for bodies we cannot read — Telegram must not retry
    let Ok(body) = serde_json::from_str::<Value>(&body) else {
        return ok.into_response();
    };
    let Ok(bot_id) = bot_id.parse::<Uuid>() else {
        return ok.into_response();
    };
    let bot = match runtime.repo.get_bot(bot_id).await {
        Ok(Some(bot)) if bot.is_active() => bot,
        Ok(_) => return ok.into_response(),
        Err(e) => {
            tracing::warn!(%bot_id, "webhook bot lookup failed: {}", e);
            return ok.into_response();
        }
    };
    let Some(update) = Update::from_webhook(&body) else {
        return ok.into_response();
    };

    let chat_id = match &update {
        Update::Message { chat_id, .. } => *chat_id,
        Update::Callback { user_id, .. } => *user_id,
    };
    let result = runtime.interp.handle(&bot, update).await;
    for reply in &result.replies {
        if let Err(e) = runtime.outbound.send(&bot.token, chat_id, reply).await {
            tracing::warn!(%bot_id, chat_id, "webhook reply send failed: {}", e);
        }
    }

    runtime
        .metrics
        .webhook_latency_ms
        .observe(started.elapsed().as_secs_f64() * 1_000.0);
    ok.into_response()
}
