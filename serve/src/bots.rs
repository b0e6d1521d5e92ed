//! Bot administration: CRUD, spec publish/fetch, reload, validate, purge.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use botweave::{compile, BotRecord};

use crate::app::AppState;
use crate::error::{db_err, ApiError};

#[derive(Serialize)]
pub struct BotDto {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub llm_enabled: bool,
    pub llm_preset: String,
    pub daily_budget_limit: i64,
    pub default_locale: String,
}

impl From<&BotRecord> for BotDto {
    fn from(bot: &BotRecord) -> Self {
        BotDto {
            id: bot.id,
            name: bot.name.clone(),
            status: bot.status.clone(),
            llm_enabled: bot.llm_enabled,
            llm_preset: bot.llm_preset.clone(),
            daily_budget_limit: bot.daily_budget_limit,
            default_locale: bot.default_locale.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct BotInput {
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub llm_enabled: bool,
    #[serde(default = "default_preset")]
    pub llm_preset: String,
    #[serde(default)]
    pub daily_budget_limit: i64,
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_status() -> String {
    "active".to_string()
}

fn default_preset() -> String {
    "neutral".to_string()
}

fn default_locale() -> String {
    "ru".to_string()
}

fn check_input(input: &BotInput) -> Result<(), ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if !matches!(input.status.as_str(), "active" | "disabled") {
        return Err(ApiError::bad_request("status must be active or disabled"));
    }
    if !matches!(input.llm_preset.as_str(), "short" | "neutral" | "detailed") {
        return Err(ApiError::bad_request(
            "llm_preset must be short, neutral or detailed",
        ));
    }
    Ok(())
}

fn record_from(id: Uuid, input: &BotInput) -> BotRecord {
    BotRecord {
        id,
        name: input.name.clone(),
        token: input.token.clone(),
        status: input.status.clone(),
        llm_enabled: input.llm_enabled,
        llm_preset: input.llm_preset.clone(),
        daily_budget_limit: input.daily_budget_limit,
        default_locale: input.default_locale.clone(),
    }
}

pub async fn create(
    State(runtime): State<AppState>,
    Json(input): Json<BotInput>,
) -> Result<(StatusCode, Json<BotDto>), ApiError> {
    check_input(&input)?;
    let record = record_from(Uuid::new_v4(), &input);
    runtime.repo.create_bot(&record).await.map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(BotDto::from(&record))))
}

pub async fn list(State(runtime): State<AppState>) -> Result<Json<Vec<BotDto>>, ApiError> {
    let bots = runtime.repo.list_bots().await.map_err(db_err)?;
    Ok(Json(bots.iter().map(BotDto::from).collect()))
}

async fn load_bot(runtime: &AppState, id: Uuid) -> Result<BotRecord, ApiError> {
    runtime
        .repo
        .get_bot(id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found("bot"))
}

pub async fn show(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BotDto>, ApiError> {
    let bot = load_bot(&runtime, id).await?;
    Ok(Json(BotDto::from(&bot)))
}

pub async fn update(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<BotInput>,
) -> Result<Json<BotDto>, ApiError> {
    check_input(&input)?;
    let record = record_from(id, &input);
    if !runtime.repo.update_bot(&record).await.map_err(db_err)? {
        return Err(ApiError::not_found("bot"));
    }
    Ok(Json(BotDto::from(&record)))
}

pub async fn remove(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !runtime.repo.delete_bot(id).await.map_err(db_err)? {
        return Err(ApiError::not_found("bot"));
    }
    runtime.specs.invalidate(id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_spec(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    load_bot(&runtime, id).await?;
    let (version, spec) = runtime
        .repo
        .latest_spec(id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found("spec"))?;
    Ok(Json(json!({"version": version, "spec": spec})))
}

/// Publish a new spec version. The document must compile; problems come back
/// in the envelope and nothing is published.
pub async fn put_spec(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
    Json(spec): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    load_bot(&runtime, id).await?;
    if let Err(problems) = compile(&spec, 0) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "spec_invalid",
            problems
                .iter()
                .map(|p| p.describe())
                .collect::<Vec<_>>()
                .join("; "),
        ));
    }
    let version = runtime.repo.insert_spec(id, &spec).await.map_err(db_err)?;
    runtime.specs.reload(id).await?;
    Ok(Json(json!({"version": version})))
}

pub async fn reload(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    load_bot(&runtime, id).await?;
    let version = runtime.reload_spec(id).await?;
    Ok(Json(json!({"spec_version": version})))
}

/// Compile without publishing; structured problems either way.
pub async fn validate(
    State(_runtime): State<AppState>,
    Path(_id): Path<Uuid>,
    Json(spec): Json<Value>,
) -> Json<Value> {
    match compile(&spec, 0) {
        Ok(_) => Json(json!({"valid": true, "problems": []})),
        Err(problems) => Json(json!({
            "valid": false,
            "problems": problems.iter().map(|p| p.describe()).collect::<Vec<_>>(),
        })),
    }
}

/// Erase tenant data (events, users, broadcasts, locales, i18n keys); the
/// bot record and its specs stay.
pub async fn purge_data(
    State(runtime): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    load_bot(&runtime, id).await?;
    let removed = runtime.repo.purge_bot_data(id).await.map_err(db_err)?;
    Ok(Json(json!({"removed": removed})))
}
