//! HTTP integration tests: spawn the server on a random port with in-memory
//! backends and drive it over the wire. Responses are logged with
//! `[http] received: ...`; run with `--nocapture` to see them.

use std::sync::Arc;
use std::time::Duration;

use botweave::{
    InMemoryKv, InMemorySql, MockLlm, NullOutbound, Row, Runtime, SqlOutcome, SqlValue,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

const BOT_ID: &str = "7b1e9a34-2d25-4f6a-9f3e-5a0c1de2b901";

fn bot_row() -> Row {
    let mut row = Row::new();
    row.insert("id".into(), json!(BOT_ID));
    row.insert("name".into(), json!("demo"));
    row.insert("token".into(), json!("12345:token"));
    row.insert("status".into(), json!("active"));
    row.insert("llm_enabled".into(), json!(false));
    row.insert("llm_preset".into(), json!("neutral"));
    row.insert("daily_budget_limit".into(), json!(0));
    row.insert("default_locale".into(), json!("ru"));
    row
}

fn spec_row() -> Row {
    let mut row = Row::new();
    row.insert("version".into(), json!(1));
    row.insert(
        "spec_json".into(),
        json!({"intents": [{"cmd": "/start", "reply": "Hi!"}]}),
    );
    row
}

/// SQL fake serving the demo bot and its spec; everything else gets defaults.
fn demo_sql() -> InMemorySql {
    InMemorySql::with_handler(|sql, binds| {
        if sql.contains("FROM bots WHERE id") {
            let wanted = binds
                .first()
                .map(|b| matches!(b, SqlValue::Uuid(u) if u.to_string() == BOT_ID))
                .unwrap_or(false);
            return Ok(SqlOutcome::Rows(if wanted { vec![bot_row()] } else { vec![] }));
        }
        if sql.contains("FROM bots ") {
            return Ok(SqlOutcome::Rows(vec![bot_row()]));
        }
        if sql.contains("FROM bot_specs") {
            return Ok(SqlOutcome::Rows(vec![spec_row()]));
        }
        if sql.starts_with("SELECT") || sql.contains("RETURNING") {
            return Ok(SqlOutcome::Rows(vec![]));
        }
        Ok(SqlOutcome::Affected(1))
    })
}

fn settings() -> config::Settings {
    config::Settings {
        database_url: "postgres://unused".into(),
        redis_url: "redis://unused".into(),
        llm: config::LlmSettings {
            enabled: false,
            base_url: String::new(),
            model: "m".into(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            rate_limit: 10,
            cache_ttl: Duration::from_secs(900),
        },
        log_level: "info".into(),
        events_retention_days: None,
        metrics_enabled: true,
        mask_sensitive_data: true,
        listen_addr: "127.0.0.1:0".into(),
    }
}

struct TestServer {
    base: String,
    sql: Arc<InMemorySql>,
    outbound: Arc<NullOutbound>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_server() -> TestServer {
    spawn_server_with(demo_sql()).await
}

async fn spawn_server_with(sql: InMemorySql) -> TestServer {
    let sql = Arc::new(sql);
    let outbound = Arc::new(NullOutbound::new());
    let runtime = Runtime::assemble(
        settings(),
        sql.clone(),
        Arc::new(InMemoryKv::new()),
        Arc::new(MockLlm::new()),
        outbound.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let _ = serve::run_serve_on_listener(runtime, listener).await;
    });
    TestServer {
        base,
        sql,
        outbound,
        handle,
    }
}

async fn get_json(url: &str) -> (u16, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    let text = response.text().await.unwrap();
    eprintln!("[http] received: {text}");
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

async fn post_json(url: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let text = response.text().await.unwrap();
    eprintln!("[http] received: {text}");
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_endpoints() {
    let server = spawn_server().await;
    let (status, body) = get_json(&format!("{}/health", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);

    let (status, body) = get_json(&format!("{}/health/pg", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["pg_ok"], true);

    let (status, body) = get_json(&format!("{}/health/redis", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["redis_ok"], true);

    let (status, body) = get_json(&format!("{}/health/llm", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["llm_ok"], true);
}

#[tokio::test]
async fn pg_outage_flips_health_to_503() {
    let server = spawn_server().await;
    server.sql.set_unavailable(true);
    let (status, body) = get_json(&format!("{}/health/pg", server.base)).await;
    assert_eq!(status, 503);
    assert_eq!(body["pg_ok"], false);
}

#[tokio::test]
async fn webhook_start_intent_sends_reply() {
    let server = spawn_server().await;
    let (status, body) = post_json(
        &format!("{}/tg/{}", server.base, BOT_ID),
        json!({"message": {"text": "/start", "from": {"id": 42}, "chat": {"id": 42}}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);

    let sent = server.outbound.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, 42);
    assert_eq!(sent[0].text, "Hi!");
}

#[tokio::test]
async fn webhook_unknown_bot_still_returns_200() {
    let server = spawn_server().await;
    let (status, _) = post_json(
        &format!("{}/tg/{}", server.base, Uuid::new_v4()),
        json!({"message": {"text": "/start", "from": {"id": 1}, "chat": {"id": 1}}}),
    )
    .await;
    assert_eq!(status, 200);
    assert!(server.outbound.sent().is_empty());
}

#[tokio::test]
async fn preview_returns_reply_inline() {
    let server = spawn_server().await;
    let (status, body) = post_json(
        &format!("{}/preview/send", server.base),
        json!({"bot_id": BOT_ID, "text": "/start", "user_id": 7}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["bot_reply"], "Hi!");
    assert_eq!(body["matched"], true);
    // preview must not deliver anywhere
    assert!(server.outbound.sent().is_empty());
}

#[tokio::test]
async fn preview_with_db_down_returns_error_envelope() {
    let server = spawn_server().await;
    server.sql.set_unavailable(true);
    let (status, body) = post_json(
        &format!("{}/preview/send", server.base),
        json!({"bot_id": BOT_ID, "text": "/start"}),
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "db_unavailable");
    assert!(body["error"]["trace_id"].is_string());

    // the outage is visible in the metrics
    server.sql.set_unavailable(false);
    let response = reqwest::get(&format!("{}/metrics", server.base))
        .await
        .unwrap();
    let text = response.text().await.unwrap();
    assert!(text.contains("bot_errors_total"));
    assert!(text.contains("db_unavailable"));
}

#[tokio::test]
async fn metrics_exposition_counts_updates() {
    let server = spawn_server().await;
    post_json(
        &format!("{}/preview/send", server.base),
        json!({"bot_id": BOT_ID, "text": "/start"}),
    )
    .await;
    let response = reqwest::get(&format!("{}/metrics", server.base))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    eprintln!("[http] received: {}", &text[..text.len().min(400)]);
    assert!(text.contains("bot_updates_total"));
    assert!(text.contains(BOT_ID));
}

#[tokio::test]
async fn validate_reports_problems_without_publishing() {
    let server = spawn_server().await;
    let (status, body) = post_json(
        &format!("{}/bots/{}/validate", server.base, BOT_ID),
        json!({"wizard_flows": [{"entry_cmd": "/w", "steps": [
            {"var": "x", "question": "?", "validate": {"regex": "(", "msg": "m"}}
        ]}]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["valid"], false);
    assert!(!body["problems"].as_array().unwrap().is_empty());

    let (status, body) = post_json(
        &format!("{}/bots/{}/validate", server.base, BOT_ID),
        json!({"intents": [{"cmd": "/start", "reply": "Hi!"}]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["valid"], true);
}

#[tokio::test]
async fn invalid_spec_publish_is_rejected() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .put(format!("{}/bots/{}/spec", server.base, BOT_ID))
        .json(&json!({"flows": [{"type": "flow.other.v9", "entry_cmd": "/x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "spec_invalid");
}

#[tokio::test]
async fn bots_crud_surface() {
    let server = spawn_server().await;
    let (status, body) = post_json(
        &format!("{}/bots", server.base),
        json!({"name": "new-bot", "token": "12345:abc"}),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(body["name"], "new-bot");
    assert_eq!(body["status"], "active");

    let (status, body) = get_json(&format!("{}/bots", server.base)).await;
    assert_eq!(status, 200);
    assert!(body.as_array().unwrap().len() >= 1);

    let (status, body) = post_json(
        &format!("{}/bots", server.base),
        json!({"name": "", "token": "t"}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn purge_data_reports_removed_rows() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .delete(format!("{}/bots/{}/data", server.base, BOT_ID))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["removed"].is_number());
}
