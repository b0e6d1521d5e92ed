//! `POST /preview/send` — synchronous single-update tester.
//!
//! Runs one text update through the full interpreter (events and metrics
//! included) and returns the reply instead of sending it anywhere.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use botweave::Update;

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PreviewRequest {
    pub bot_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

pub async fn send(
    State(runtime): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<Value>, ApiError> {
    let bot = match runtime.repo.get_bot(request.bot_id).await {
        Ok(Some(bot)) => bot,
        Ok(None) => return Err(ApiError::not_found("bot")),
        Err(e) => {
            if matches!(e, botweave::DbError::Unavailable(_)) {
                runtime
                    .metrics
                    .errors_total
                    .with_label_values(&[&request.bot_id.to_string(), "db", "db_unavailable"])
                    .inc();
            }
            return Err(crate::error::db_err(e));
        }
    };

    let user_id = request.user_id.unwrap_or(0);
    let update = Update::Message {
        user_id,
        chat_id: user_id,
        text: request.text,
    };
    let result = runtime.interp.try_handle(&bot, update).await?;

    let first = result.replies.first();
    Ok(Json(json!({
        "bot_reply": first.map(|r| r.text.clone()),
        "keyboard": first.and_then(|r| r.keyboard.as_ref()),
        "matched": result.matched,
    })))
}
