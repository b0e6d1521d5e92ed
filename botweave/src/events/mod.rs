//! Append-only event log.
//!
//! Every core operation emits exactly one primary event; all events of one
//! inbound update share a `trace_id`. Payloads never carry raw SQL (the
//! gatekeeper hash stands in for it) and sensitive values are masked before
//! the record leaves the process.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::{SqlRunner, SqlValue};

pub const MASKED: &str = "***masked***";

/// Keys whose values are replaced by [`MASKED`] in event payloads.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "password",
    "secret",
    "api_key",
    "apikey",
    "authorization",
    "webhook_secret",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Update,
    FlowStep,
    ActionSql,
    ActionReply,
    Error,
    WidgetRender,
    WidgetPick,
    LlmImprove,
    LlmRejected,
    BroadcastStart,
    BroadcastDelivery,
    BroadcastFinish,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Update => "update",
            EventType::FlowStep => "flow_step",
            EventType::ActionSql => "action_sql",
            EventType::ActionReply => "action_reply",
            EventType::Error => "error",
            EventType::WidgetRender => "widget_render",
            EventType::WidgetPick => "widget_pick",
            EventType::LlmImprove => "llm_improve",
            EventType::LlmRejected => "llm_rejected",
            EventType::BroadcastStart => "broadcast_start",
            EventType::BroadcastDelivery => "broadcast_delivery",
            EventType::BroadcastFinish => "broadcast_finish",
        }
    }
}

/// One event record, as written to `bot_events`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub bot_id: Uuid,
    pub user_id: Option<i64>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
}

impl Event {
    pub fn new(bot_id: Uuid, user_id: Option<i64>, event_type: EventType, trace_id: Uuid) -> Self {
        Event {
            ts: Utc::now(),
            bot_id,
            user_id,
            event_type,
            data: json!({ "trace_id": trace_id.to_string() }),
        }
    }

    /// Attach one payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Error event with the standard `where`/`code` fields.
    pub fn error(
        bot_id: Uuid,
        user_id: Option<i64>,
        trace_id: Uuid,
        component: &str,
        code: crate::error::ErrorCode,
    ) -> Self {
        Event::new(bot_id, user_id, EventType::Error, trace_id)
            .with("where", component)
            .with("code", code.as_str())
    }
}

/// Replace sensitive values in the payload. Walks nested objects; arrays are
/// scanned for objects too.
pub fn mask_data(data: &mut Value) {
    match data {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&k.to_lowercase().as_str()) {
                    *v = Value::String(MASKED.to_string());
                } else {
                    mask_data(v);
                }
            }
        }
        Value::Array(items) => {
            for v in items {
                mask_data(v);
            }
        }
        _ => {}
    }
}

/// Event sink seam. Emitting never fails the caller: impls log and drop on
/// write errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Writes events to `bot_events` through the driver seam.
pub struct PgEventSink {
    runner: std::sync::Arc<dyn SqlRunner>,
    mask: bool,
}

impl PgEventSink {
    pub fn new(runner: std::sync::Arc<dyn SqlRunner>, mask: bool) -> Self {
        Self { runner, mask }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn emit(&self, mut event: Event) {
        if self.mask {
            mask_data(&mut event.data);
        }
        tracing::debug!(
            bot_id = %event.bot_id,
            event_type = event.event_type.as_str(),
            "event"
        );
        let result = self
            .runner
            .execute(
                "INSERT INTO bot_events (ts, bot_id, user_id, type, data) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    SqlValue::Timestamp(event.ts),
                    SqlValue::Uuid(event.bot_id),
                    match event.user_id {
                        Some(u) => SqlValue::Int(u),
                        None => SqlValue::Null,
                    },
                    SqlValue::Text(event.event_type.as_str().to_string()),
                    SqlValue::Json(event.data.clone()),
                ],
                Duration::from_secs(10),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("event write failed: {}", e);
        }
    }
}

/// Collects events in memory; used by tests and the preview tester.
#[derive(Default)]
pub struct MemoryEventSink {
    mask: bool,
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn masking() -> Self {
        Self {
            mask: true,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event sink lock").clone()
    }

    /// Event types in emission order; handy for precedence assertions.
    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, mut event: Event) {
        if self.mask {
            mask_data(&mut event.data);
        }
        self.events.lock().expect("event sink lock").push(event);
    }
}
