//! Runtime-owned queries: bot records, spec versions, bot users, broadcast
//! bookkeeping, locale and i18n lookups, tenant purge, event retention.
//!
//! Every statement carries a `bot_id` predicate; tenant isolation lives here
//! and in the gatekeeper's implicit binds, not in the callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{DbError, Row, SqlRunner, SqlValue};
use crate::broadcast::Audience;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct BotRecord {
    pub id: Uuid,
    pub name: String,
    pub token: String,
    pub status: String,
    pub llm_enabled: bool,
    pub llm_preset: String,
    pub daily_budget_limit: i64,
    pub default_locale: String,
}

impl BotRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastRecord {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub audience: Audience,
    pub message: String,
    pub per_sec: u32,
    pub status: String,
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub blocked: i64,
}

/// Repository over the driver seam. Cloning shares the runner.
#[derive(Clone)]
pub struct Repo {
    runner: Arc<dyn SqlRunner>,
}

fn text(row: &Row, key: &str) -> String {
    row.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn int(row: &Row, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn boolean(row: &Row, key: &str) -> bool {
    row.get(key).and_then(Value::as_bool).unwrap_or_default()
}

fn id(row: &Row, key: &str) -> Result<Uuid, DbError> {
    text(row, key)
        .parse()
        .map_err(|_| DbError::Query(format!("bad uuid in column {key}")))
}

fn bot_record(row: &Row) -> Result<BotRecord, DbError> {
    Ok(BotRecord {
        id: id(row, "id")?,
        name: text(row, "name"),
        token: text(row, "token"),
        status: text(row, "status"),
        llm_enabled: boolean(row, "llm_enabled"),
        llm_preset: text(row, "llm_preset"),
        daily_budget_limit: int(row, "daily_budget_limit"),
        default_locale: {
            let l = text(row, "default_locale");
            if l.is_empty() {
                "ru".to_string()
            } else {
                l
            }
        },
    })
}

fn broadcast_record(row: &Row) -> Result<BroadcastRecord, DbError> {
    Ok(BroadcastRecord {
        id: id(row, "id")?,
        bot_id: id(row, "bot_id")?,
        audience: Audience::parse(&text(row, "audience"))
            .ok_or_else(|| DbError::Query("bad audience in broadcasts row".into()))?,
        message: text(row, "message"),
        per_sec: int(row, "throttle_per_sec").max(1) as u32,
        status: text(row, "status"),
        total: int(row, "total"),
        sent: int(row, "sent"),
        failed: int(row, "failed"),
        blocked: int(row, "blocked"),
    })
}

impl Repo {
    pub fn new(runner: Arc<dyn SqlRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<dyn SqlRunner> {
        &self.runner
    }

    // ---- bots ----

    pub async fn get_bot(&self, bot_id: Uuid) -> Result<Option<BotRecord>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT id, name, token, status, llm_enabled, llm_preset, daily_budget_limit, default_locale \
                 FROM bots WHERE id = $1",
                &[SqlValue::Uuid(bot_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        rows.first().map(bot_record).transpose()
    }

    pub async fn list_bots(&self) -> Result<Vec<BotRecord>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT id, name, token, status, llm_enabled, llm_preset, daily_budget_limit, default_locale \
                 FROM bots ORDER BY name",
                &[],
                QUERY_TIMEOUT,
            )
            .await?;
        rows.iter().map(bot_record).collect()
    }

    pub async fn create_bot(&self, bot: &BotRecord) -> Result<(), DbError> {
        self.runner
            .execute(
                "INSERT INTO bots (id, name, token, status, llm_enabled, llm_preset, daily_budget_limit, default_locale) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    SqlValue::Uuid(bot.id),
                    SqlValue::Text(bot.name.clone()),
                    SqlValue::Text(bot.token.clone()),
                    SqlValue::Text(bot.status.clone()),
                    SqlValue::Bool(bot.llm_enabled),
                    SqlValue::Text(bot.llm_preset.clone()),
                    SqlValue::Int(bot.daily_budget_limit),
                    SqlValue::Text(bot.default_locale.clone()),
                ],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn update_bot(&self, bot: &BotRecord) -> Result<bool, DbError> {
        let n = self
            .runner
            .execute(
                "UPDATE bots SET name = $2, token = $3, status = $4, llm_enabled = $5, \
                 llm_preset = $6, daily_budget_limit = $7, default_locale = $8 WHERE id = $1",
                &[
                    SqlValue::Uuid(bot.id),
                    SqlValue::Text(bot.name.clone()),
                    SqlValue::Text(bot.token.clone()),
                    SqlValue::Text(bot.status.clone()),
                    SqlValue::Bool(bot.llm_enabled),
                    SqlValue::Text(bot.llm_preset.clone()),
                    SqlValue::Int(bot.daily_budget_limit),
                    SqlValue::Text(bot.default_locale.clone()),
                ],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(n > 0)
    }

    pub async fn delete_bot(&self, bot_id: Uuid) -> Result<bool, DbError> {
        let n = self
            .runner
            .execute(
                "DELETE FROM bots WHERE id = $1",
                &[SqlValue::Uuid(bot_id)],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(n > 0)
    }

    // ---- specs ----

    /// Highest published spec version for a bot.
    pub async fn latest_spec(&self, bot_id: Uuid) -> Result<Option<(i64, Value)>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT version, spec_json FROM bot_specs WHERE bot_id = $1 \
                 ORDER BY version DESC LIMIT 1",
                &[SqlValue::Uuid(bot_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(rows.first().map(|row| {
            (
                int(row, "version"),
                row.get("spec_json").cloned().unwrap_or(Value::Null),
            )
        }))
    }

    /// Publish a new spec version; versions are per-bot and monotonically
    /// increasing.
    pub async fn insert_spec(&self, bot_id: Uuid, spec_json: &Value) -> Result<i64, DbError> {
        let rows = self
            .runner
            .fetch(
                "INSERT INTO bot_specs (bot_id, version, spec_json) \
                 SELECT $1, COALESCE(MAX(version), 0) + 1, $2 FROM bot_specs WHERE bot_id = $1 \
                 RETURNING version",
                &[SqlValue::Uuid(bot_id), SqlValue::Json(spec_json.clone())],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(rows.first().map(|r| int(r, "version")).unwrap_or(1))
    }

    // ---- bot users ----

    /// Record activity; the broadcast audience queries read `last_active`.
    pub async fn touch_user(&self, bot_id: Uuid, user_id: i64) -> Result<(), DbError> {
        self.runner
            .execute(
                "INSERT INTO bot_users (bot_id, user_id, last_active, is_active) \
                 VALUES ($1, $2, now(), true) \
                 ON CONFLICT (bot_id, user_id) DO UPDATE SET last_active = now(), is_active = true",
                &[SqlValue::Uuid(bot_id), SqlValue::Int(user_id)],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn mark_user_blocked(&self, bot_id: Uuid, user_id: i64) -> Result<(), DbError> {
        self.runner
            .execute(
                "UPDATE bot_users SET is_active = false WHERE bot_id = $1 AND user_id = $2",
                &[SqlValue::Uuid(bot_id), SqlValue::Int(user_id)],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// `tag_placeholder` is the `$N` the segment tag binds to in the caller's
    /// statement.
    fn audience_predicate(audience: &Audience, tag_placeholder: usize) -> (String, Option<String>) {
        match audience {
            Audience::All => (String::new(), None),
            Audience::Active7d => (
                " AND last_active > now() - interval '7 days'".to_string(),
                None,
            ),
            Audience::Segment(tag) => (
                format!(" AND ${tag_placeholder} = ANY(segment_tags)"),
                Some(tag.clone()),
            ),
        }
    }

    /// Next chunk of audience user ids, keyset-paginated by `user_id`.
    pub async fn audience_chunk(
        &self,
        bot_id: Uuid,
        audience: &Audience,
        after_user_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, DbError> {
        let (extra, tag) = Self::audience_predicate(audience, 4);
        let sql = format!(
            "SELECT user_id FROM bot_users \
             WHERE bot_id = $1 AND is_active AND user_id > $2{extra} \
             ORDER BY user_id LIMIT $3"
        );
        let mut binds = vec![
            SqlValue::Uuid(bot_id),
            SqlValue::Int(after_user_id),
            SqlValue::Int(limit),
        ];
        if let Some(tag) = tag {
            binds.push(SqlValue::Text(tag));
        }
        let rows = self.runner.fetch(&sql, &binds, QUERY_TIMEOUT).await?;
        Ok(rows.iter().map(|r| int(r, "user_id")).collect())
    }

    pub async fn audience_count(
        &self,
        bot_id: Uuid,
        audience: &Audience,
    ) -> Result<i64, DbError> {
        let (extra, tag) = Self::audience_predicate(audience, 2);
        let sql = format!(
            "SELECT count(*) AS n FROM bot_users WHERE bot_id = $1 AND is_active{extra}"
        );
        let mut binds = vec![SqlValue::Uuid(bot_id)];
        if let Some(tag) = tag {
            binds.push(SqlValue::Text(tag));
        }
        let rows = self.runner.fetch(&sql, &binds, QUERY_TIMEOUT).await?;
        Ok(rows.first().map(|r| int(r, "n")).unwrap_or(0))
    }

    // ---- broadcasts ----

    pub async fn create_broadcast(&self, b: &BroadcastRecord) -> Result<(), DbError> {
        self.runner
            .execute(
                "INSERT INTO broadcasts (id, bot_id, audience, message, throttle_per_sec, status, \
                 total, sent, failed, blocked, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 0, 0, now())",
                &[
                    SqlValue::Uuid(b.id),
                    SqlValue::Uuid(b.bot_id),
                    SqlValue::Text(b.audience.to_string()),
                    SqlValue::Text(b.message.clone()),
                    SqlValue::Int(b.per_sec as i64),
                    SqlValue::Text(b.status.clone()),
                    SqlValue::Int(b.total),
                ],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn get_broadcast(
        &self,
        bot_id: Uuid,
        broadcast_id: Uuid,
    ) -> Result<Option<BroadcastRecord>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT id, bot_id, audience, message, throttle_per_sec, status, \
                 total, sent, failed, blocked \
                 FROM broadcasts WHERE bot_id = $1 AND id = $2",
                &[SqlValue::Uuid(bot_id), SqlValue::Uuid(broadcast_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        rows.first().map(broadcast_record).transpose()
    }

    /// Broadcasts left over from a previous process, ready to resume.
    pub async fn resumable_broadcasts(&self) -> Result<Vec<BroadcastRecord>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT id, bot_id, audience, message, throttle_per_sec, status, \
                 total, sent, failed, blocked \
                 FROM broadcasts WHERE status IN ('pending', 'running') ORDER BY created_at",
                &[],
                QUERY_TIMEOUT,
            )
            .await?;
        rows.iter().map(broadcast_record).collect()
    }

    pub async fn set_broadcast_status(
        &self,
        broadcast_id: Uuid,
        status: &str,
    ) -> Result<(), DbError> {
        let sql = match status {
            "running" => {
                "UPDATE broadcasts SET status = $2, started_at = COALESCE(started_at, now()) \
                 WHERE id = $1"
            }
            "completed" | "failed" => {
                "UPDATE broadcasts SET status = $2, finished_at = now() WHERE id = $1"
            }
            _ => "UPDATE broadcasts SET status = $2 WHERE id = $1",
        };
        self.runner
            .execute(
                sql,
                &[SqlValue::Uuid(broadcast_id), SqlValue::Text(status.to_string())],
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Record one delivery outcome and bump the matching live counter.
    pub async fn record_delivery(
        &self,
        broadcast_id: Uuid,
        user_id: i64,
        status: &str,
        error_code: Option<&str>,
    ) -> Result<(), DbError> {
        self.runner
            .execute(
                "INSERT INTO broadcast_events (broadcast_id, user_id, status, error_code, sent_at) \
                 VALUES ($1, $2, $3, $4, now())",
                &[
                    SqlValue::Uuid(broadcast_id),
                    SqlValue::Int(user_id),
                    SqlValue::Text(status.to_string()),
                    match error_code {
                        Some(c) => SqlValue::Text(c.to_string()),
                        None => SqlValue::Null,
                    },
                ],
                EXEC_TIMEOUT,
            )
            .await?;
        let counter_sql = match status {
            "sent" => "UPDATE broadcasts SET sent = sent + 1 WHERE id = $1",
            "blocked" => "UPDATE broadcasts SET blocked = blocked + 1 WHERE id = $1",
            _ => "UPDATE broadcasts SET failed = failed + 1 WHERE id = $1",
        };
        self.runner
            .execute(counter_sql, &[SqlValue::Uuid(broadcast_id)], EXEC_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Highest user_id with a recorded delivery; resumption starts after it.
    pub async fn last_delivered_user(&self, broadcast_id: Uuid) -> Result<Option<i64>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT MAX(user_id) AS last FROM broadcast_events WHERE broadcast_id = $1",
                &[SqlValue::Uuid(broadcast_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("last"))
            .and_then(Value::as_i64))
    }

    // ---- locale / i18n ----

    pub async fn user_locale(&self, bot_id: Uuid, user_id: i64) -> Result<Option<String>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT locale FROM locales WHERE bot_id = $1 AND user_id = $2 LIMIT 1",
                &[SqlValue::Uuid(bot_id), SqlValue::Int(user_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(rows.first().map(|r| text(r, "locale")).filter(|l| !l.is_empty()))
    }

    pub async fn chat_locale(&self, bot_id: Uuid, chat_id: i64) -> Result<Option<String>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT locale FROM locales WHERE bot_id = $1 AND chat_id = $2 LIMIT 1",
                &[SqlValue::Uuid(bot_id), SqlValue::Int(chat_id)],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(rows.first().map(|r| text(r, "locale")).filter(|l| !l.is_empty()))
    }

    pub async fn i18n_value(
        &self,
        bot_id: Uuid,
        locale: &str,
        key: &str,
    ) -> Result<Option<String>, DbError> {
        let rows = self
            .runner
            .fetch(
                "SELECT value FROM i18n_keys WHERE bot_id = $1 AND locale = $2 AND key = $3 LIMIT 1",
                &[
                    SqlValue::Uuid(bot_id),
                    SqlValue::Text(locale.to_string()),
                    SqlValue::Text(key.to_string()),
                ],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(rows.first().map(|r| text(r, "value")))
    }

    // ---- housekeeping ----

    /// Erase tenant rows; the bot record itself stays.
    pub async fn purge_bot_data(&self, bot_id: Uuid) -> Result<u64, DbError> {
        let mut removed = 0u64;
        for sql in [
            "DELETE FROM broadcast_events WHERE broadcast_id IN \
             (SELECT id FROM broadcasts WHERE bot_id = $1)",
            "DELETE FROM broadcasts WHERE bot_id = $1",
            "DELETE FROM bot_events WHERE bot_id = $1",
            "DELETE FROM bot_users WHERE bot_id = $1",
            "DELETE FROM locales WHERE bot_id = $1",
            "DELETE FROM i18n_keys WHERE bot_id = $1",
        ] {
            removed += self
                .runner
                .execute(sql, &[SqlValue::Uuid(bot_id)], EXEC_TIMEOUT)
                .await?;
        }
        Ok(removed)
    }

    /// Drop events older than the retention horizon. Returns rows removed.
    pub async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        self.runner
            .execute(
                "DELETE FROM bot_events WHERE ts < $1",
                &[SqlValue::Timestamp(cutoff)],
                EXEC_TIMEOUT,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemorySql;

    #[tokio::test]
    async fn every_tenant_query_binds_bot_id() {
        let sql = Arc::new(InMemorySql::new());
        let repo = Repo::new(sql.clone());
        let bot = Uuid::new_v4();

        let _ = repo.get_bot(bot).await;
        let _ = repo.latest_spec(bot).await;
        let _ = repo.touch_user(bot, 7).await;
        let _ = repo.user_locale(bot, 7).await;
        let _ = repo.i18n_value(bot, "ru", "hello").await;
        let _ = repo.audience_chunk(bot, &Audience::All, 0, 100).await;
        let _ = repo.purge_bot_data(bot).await;

        for (stmt, binds) in sql.statements() {
            assert!(
                binds.contains(&SqlValue::Uuid(bot)),
                "statement missing bot_id bind: {stmt}"
            );
        }
    }

    #[tokio::test]
    async fn segment_audience_adds_tag_bind() {
        let sql = Arc::new(InMemorySql::new());
        let repo = Repo::new(sql.clone());
        let bot = Uuid::new_v4();
        let _ = repo
            .audience_chunk(bot, &Audience::Segment("vip".into()), 0, 100)
            .await;
        let (stmt, binds) = sql.statements().pop().unwrap();
        assert!(stmt.contains("ANY(segment_tags)"));
        assert!(binds.contains(&SqlValue::Text("vip".into())));
    }
}
