//! Broadcast administration: create and inspect.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use botweave::{Audience, BroadcastRecord, BroadcastRequest};

use crate::app::AppState;
use crate::error::{db_err, ApiError};

#[derive(Deserialize)]
pub struct ThrottleInput {
    pub per_sec: u32,
}

#[derive(Deserialize)]
pub struct BroadcastInput {
    pub audience: String,
    pub message: String,
    pub throttle: ThrottleInput,
}

fn record_json(record: &BroadcastRecord) -> Value {
    json!({
        "id": record.id,
        "bot_id": record.bot_id,
        "audience": record.audience.to_string(),
        "status": record.status,
        "total": record.total,
        "sent": record.sent,
        "failed": record.failed,
        "blocked": record.blocked,
    })
}

pub async fn create(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<BroadcastInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let bot = runtime
        .repo
        .get_bot(id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found("bot"))?;
    let audience = Audience::parse(&input.audience)
        .ok_or_else(|| ApiError::bad_request("audience must be all, active_7d or segment:<tag>"))?;
    if input.throttle.per_sec == 0 {
        return Err(ApiError::bad_request("throttle.per_sec must be positive"));
    }
    let record = runtime
        .broadcasts
        .start(
            &bot,
            BroadcastRequest {
                audience,
                message: input.message,
                per_sec: input.throttle.per_sec,
            },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record_json(&record))))
}

pub async fn show(
    State(runtime): State<AppState>,
    Path((id, bid)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    let record = runtime
        .repo
        .get_broadcast(id, bid)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found("broadcast"))?;
    Ok(Json(record_json(&record)))
}
