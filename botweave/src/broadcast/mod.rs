//! Broadcast engine: throttled, resumable fan-out to a bot's audience.
//!
//! One long-running task per broadcast. Users are enumerated in stable
//! `user_id` order with keyset pagination, the message is rendered per
//! recipient, delivery is shaped to `per_sec` with one-second granularity,
//! and every recipient gets exactly one `broadcast_events` row. On restart,
//! broadcasts left in `pending`/`running` resume from the first user without
//! a recorded row.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{BotRecord, BroadcastRecord, Repo};
use crate::error::RuntimeError;
use crate::events::{Event, EventSink, EventType};
use crate::i18n::I18nResolver;
use crate::metrics::Metrics;
use crate::outbound::{Outbound, SendFailure};
use crate::template::{self, Scope};

/// Chunk size for audience enumeration.
const CHUNK: i64 = 1_000;

/// Transient failures get this many delivery attempts in total.
const MAX_ATTEMPTS: u32 = 4;

/// Backoff before attempt 2, 3, 4.
const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
];

/// Who a broadcast goes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    All,
    Active7d,
    Segment(String),
}

impl Audience {
    pub fn parse(s: &str) -> Option<Audience> {
        match s {
            "all" => Some(Audience::All),
            "active_7d" => Some(Audience::Active7d),
            other => other.strip_prefix("segment:").map(|tag| {
                Audience::Segment(tag.to_string())
            }),
        }
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::All => f.write_str("all"),
            Audience::Active7d => f.write_str("active_7d"),
            Audience::Segment(tag) => write!(f, "segment:{tag}"),
        }
    }
}

/// Request to start a broadcast.
#[derive(Clone, Debug)]
pub struct BroadcastRequest {
    pub audience: Audience,
    pub message: String,
    pub per_sec: u32,
}

/// Cheap handle: clones share the underlying services, so workers carry
/// their own copy into the spawned task.
#[derive(Clone)]
pub struct BroadcastEngine {
    repo: Repo,
    outbound: Arc<dyn Outbound>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    i18n: I18nResolver,
    shutdown: CancellationToken,
}

impl BroadcastEngine {
    pub fn new(
        repo: Repo,
        outbound: Arc<dyn Outbound>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        i18n: I18nResolver,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            outbound,
            events,
            metrics,
            i18n,
            shutdown,
        }
    }

    /// Create the broadcast record and spawn its worker.
    pub async fn start(
        &self,
        bot: &BotRecord,
        request: BroadcastRequest,
    ) -> Result<BroadcastRecord, RuntimeError> {
        let total = self
            .repo
            .audience_count(bot.id, &request.audience)
            .await
            .map_err(db_err)?;
        let record = BroadcastRecord {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            audience: request.audience,
            message: request.message,
            per_sec: request.per_sec.max(1),
            status: "pending".to_string(),
            total,
            sent: 0,
            failed: 0,
            blocked: 0,
        };
        self.repo.create_broadcast(&record).await.map_err(db_err)?;
        self.spawn_worker(bot.clone(), record.clone());
        Ok(record)
    }

    /// Re-spawn workers for broadcasts interrupted by a restart.
    pub async fn resume_pending(&self) -> Result<usize, RuntimeError> {
        let pending = self.repo.resumable_broadcasts().await.map_err(db_err)?;
        let mut resumed = 0;
        for record in pending {
            match self.repo.get_bot(record.bot_id).await.map_err(db_err)? {
                Some(bot) => {
                    tracing::info!(broadcast_id = %record.id, "resuming broadcast");
                    self.spawn_worker(bot, record);
                    resumed += 1;
                }
                None => {
                    self.repo
                        .set_broadcast_status(record.id, "failed")
                        .await
                        .map_err(db_err)?;
                }
            }
        }
        Ok(resumed)
    }

    fn spawn_worker(&self, bot: BotRecord, record: BroadcastRecord) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(&bot, &record).await {
                tracing::warn!(broadcast_id = %record.id, "broadcast failed: {}", e);
                let _ = engine.repo.set_broadcast_status(record.id, "failed").await;
            }
        })
    }

    async fn run(&self, bot: &BotRecord, record: &BroadcastRecord) -> Result<(), RuntimeError> {
        self.repo
            .set_broadcast_status(record.id, "running")
            .await
            .map_err(db_err)?;
        self.events
            .emit(
                Event::new(bot.id, None, EventType::BroadcastStart, Uuid::new_v4())
                    .with("broadcast_id", record.id.to_string())
                    .with("audience", record.audience.to_string())
                    .with("total", record.total),
            )
            .await;

        // keyset resume point: the highest user with a recorded delivery
        let mut after = self
            .repo
            .last_delivered_user(record.id)
            .await
            .map_err(db_err)?
            .unwrap_or(0);

        let mut shaper = Shaper::new(record.per_sec);
        loop {
            if self.shutdown.is_cancelled() {
                // left as running; the next process resumes it
                return Ok(());
            }
            let chunk = self
                .repo
                .audience_chunk(bot.id, &record.audience, after, CHUNK)
                .await
                .map_err(db_err)?;
            if chunk.is_empty() {
                break;
            }
            for user_id in chunk {
                after = user_id;
                if self.shutdown.is_cancelled() {
                    return Ok(());
                }
                shaper.acquire().await;
                let status = self.deliver(bot, record, user_id).await;
                self.repo
                    .record_delivery(record.id, user_id, status.0, status.1)
                    .await
                    .map_err(db_err)?;
            }
        }

        self.repo
            .set_broadcast_status(record.id, "completed")
            .await
            .map_err(db_err)?;
        self.events
            .emit(
                Event::new(bot.id, None, EventType::BroadcastFinish, Uuid::new_v4())
                    .with("broadcast_id", record.id.to_string())
                    .with("status", "completed"),
            )
            .await;
        Ok(())
    }

    /// One recipient: render, send with bounded retries, classify.
    async fn deliver(
        &self,
        bot: &BotRecord,
        record: &BroadcastRecord,
        user_id: i64,
    ) -> (&'static str, Option<&'static str>) {
        let resolved = self
            .i18n
            .resolve(bot.id, &bot.default_locale, Some(user_id), None, &record.message)
            .await;
        let mut scope = Scope::new();
        scope.insert("user_id".into(), json!(user_id));
        let text = match template::render(&resolved, &scope, None) {
            Ok(t) => t,
            Err(e) => e.fallback,
        };
        let reply = crate::actions::Reply::text(text);

        let bot_label = bot.id.to_string();
        for attempt in 0..MAX_ATTEMPTS {
            match self.outbound.send(&bot.token, user_id, &reply).await {
                Ok(()) => {
                    self.metrics
                        .broadcast_sent_total
                        .with_label_values(&[&bot_label])
                        .inc();
                    return ("sent", None);
                }
                Err(SendFailure::Blocked) => {
                    let _ = self.repo.mark_user_blocked(bot.id, user_id).await;
                    return ("blocked", Some("user_blocked"));
                }
                Err(SendFailure::Transient(reason)) => {
                    tracing::debug!(
                        user_id,
                        attempt = attempt + 1,
                        "broadcast delivery failed: {}",
                        reason
                    );
                    if let Some(base) = BACKOFF.get(attempt as usize) {
                        let jitter = rand::thread_rng().gen_range(0..250);
                        tokio::time::sleep(*base + Duration::from_millis(jitter)).await;
                    }
                }
            }
        }
        self.metrics
            .broadcast_failed_total
            .with_label_values(&[&bot_label])
            .inc();
        ("failed", Some("transient"))
    }
}

fn db_err(e: crate::db::DbError) -> RuntimeError {
    match e {
        crate::db::DbError::Unavailable(m) => RuntimeError::DbUnavailable(m),
        crate::db::DbError::Query(m) => RuntimeError::Sql(m),
    }
}

/// Leaky-bucket shaper with one-second granularity: at most `per_sec` sends
/// per wall-clock second.
struct Shaper {
    per_sec: u32,
    window_start: tokio::time::Instant,
    sent_in_window: u32,
}

impl Shaper {
    fn new(per_sec: u32) -> Self {
        Self {
            per_sec: per_sec.max(1),
            window_start: tokio::time::Instant::now(),
            sent_in_window: 0,
        }
    }

    async fn acquire(&mut self) {
        let window = Duration::from_secs(1);
        loop {
            let now = tokio::time::Instant::now();
            if now.duration_since(self.window_start) >= window {
                self.window_start = now;
                self.sent_in_window = 0;
            }
            if self.sent_in_window < self.per_sec {
                self.sent_in_window += 1;
                return;
            }
            tokio::time::sleep_until(self.window_start + window).await;
        }
    }
}
