//! Database access.
//!
//! All runtime SQL goes through the [`SqlRunner`] trait: spec-supplied
//! statements (already validated by the gatekeeper) and the runtime's own
//! repository queries alike. The production impl wraps a `sqlx::PgPool`;
//! tests and the preview sandbox use [`InMemorySql`]. Queries are dynamic
//! (`sqlx::query`, not the macros) because spec SQL only exists at runtime.

mod pg;
mod repo;

pub use pg::PgRunner;
pub use repo::{BotRecord, BroadcastRecord, Repo};

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::template::Scope;

/// One bound parameter. The gatekeeper emits bind names; the executor maps
/// them to values with this enum so drivers see real types, not strings.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl SqlValue {
    /// Convert a scope value (wizard var or query result) into a bind.
    pub fn from_scope_value(v: &Value) -> SqlValue {
        match v {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Json(other.clone()),
        }
    }
}

/// A fetched row as column name → JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum DbError {
    /// Pool exhausted or transport down; surfaces as `db_unavailable`.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// Statement failed (or hit its statement timeout); surfaces as `sql_error`.
    #[error("query failed: {0}")]
    Query(String),
}

/// Driver seam: run one statement with positional binds.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn fetch(
        &self,
        sql: &str,
        binds: &[SqlValue],
        timeout: Duration,
    ) -> Result<Vec<Row>, DbError>;

    async fn execute(
        &self,
        sql: &str,
        binds: &[SqlValue],
        timeout: Duration,
    ) -> Result<u64, DbError>;

    /// Liveness probe for the health endpoints.
    async fn ping(&self) -> Result<(), DbError>;
}

/// Resolve the gatekeeper's bind names to values: implicit tenant identifiers
/// first, then wizard/handler vars.
pub fn resolve_binds(
    params: &[String],
    bot_id: Uuid,
    user_id: Option<i64>,
    vars: &Scope,
) -> Vec<SqlValue> {
    params
        .iter()
        .map(|name| match name.as_str() {
            "bot_id" => SqlValue::Uuid(bot_id),
            "user_id" => match user_id {
                Some(u) => SqlValue::Int(u),
                None => SqlValue::Null,
            },
            other => vars
                .get(other)
                .map(SqlValue::from_scope_value)
                .unwrap_or(SqlValue::Null),
        })
        .collect()
}

type SqlHandler = dyn Fn(&str, &[SqlValue]) -> Result<SqlOutcome, DbError> + Send + Sync;

/// Canned response for [`InMemorySql`].
#[derive(Clone, Debug)]
pub enum SqlOutcome {
    Rows(Vec<Row>),
    Affected(u64),
}

/// Programmable stand-in for tests and the preview sandbox: every statement
/// is recorded, responses come from an optional handler closure.
pub struct InMemorySql {
    handler: Option<Box<SqlHandler>>,
    log: Mutex<Vec<(String, Vec<SqlValue>)>>,
    fail_unavailable: std::sync::atomic::AtomicBool,
}

impl Default for InMemorySql {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySql {
    pub fn new() -> Self {
        Self {
            handler: None,
            log: Mutex::new(Vec::new()),
            fail_unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Route statements through `handler` instead of the defaults
    /// (empty row set / one row affected).
    pub fn with_handler(
        handler: impl Fn(&str, &[SqlValue]) -> Result<SqlOutcome, DbError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            log: Mutex::new(Vec::new()),
            fail_unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make every call fail with `Unavailable` (DB outage scenarios).
    pub fn set_unavailable(&self, down: bool) {
        self.fail_unavailable
            .store(down, std::sync::atomic::Ordering::SeqCst);
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.log.lock().expect("sql log lock").clone()
    }

    fn record(&self, sql: &str, binds: &[SqlValue]) -> Result<(), DbError> {
        if self.fail_unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DbError::Unavailable("connection refused".into()));
        }
        self.log
            .lock()
            .expect("sql log lock")
            .push((sql.to_string(), binds.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl SqlRunner for InMemorySql {
    async fn fetch(
        &self,
        sql: &str,
        binds: &[SqlValue],
        _timeout: Duration,
    ) -> Result<Vec<Row>, DbError> {
        self.record(sql, binds)?;
        match &self.handler {
            Some(h) => match h(sql, binds)? {
                SqlOutcome::Rows(rows) => Ok(rows),
                SqlOutcome::Affected(_) => Ok(Vec::new()),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn execute(
        &self,
        sql: &str,
        binds: &[SqlValue],
        _timeout: Duration,
    ) -> Result<u64, DbError> {
        self.record(sql, binds)?;
        match &self.handler {
            Some(h) => match h(sql, binds)? {
                SqlOutcome::Affected(n) => Ok(n),
                SqlOutcome::Rows(_) => Ok(0),
            },
            None => Ok(1),
        }
    }

    async fn ping(&self) -> Result<(), DbError> {
        if self.fail_unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DbError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binds_resolve_tenant_then_vars() {
        let vars: Scope = json!({"service": "massage"}).as_object().unwrap().clone();
        let bot = Uuid::new_v4();
        let binds = resolve_binds(
            &["bot_id".into(), "user_id".into(), "service".into(), "gone".into()],
            bot,
            Some(7),
            &vars,
        );
        assert_eq!(binds[0], SqlValue::Uuid(bot));
        assert_eq!(binds[1], SqlValue::Int(7));
        assert_eq!(binds[2], SqlValue::Text("massage".into()));
        assert_eq!(binds[3], SqlValue::Null);
    }

    #[tokio::test]
    async fn in_memory_records_and_answers() {
        let sql = InMemorySql::with_handler(|stmt, _| {
            if stmt.starts_with("SELECT") {
                let mut row = Row::new();
                row.insert("n".into(), json!(1));
                Ok(SqlOutcome::Rows(vec![row]))
            } else {
                Ok(SqlOutcome::Affected(3))
            }
        });
        let rows = sql
            .fetch("SELECT 1", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let n = sql
            .execute("UPDATE t SET a = 1", &[], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(sql.statements().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_mode() {
        let sql = InMemorySql::new();
        sql.set_unavailable(true);
        let r = sql.fetch("SELECT 1", &[], Duration::from_secs(1)).await;
        assert!(matches!(r, Err(DbError::Unavailable(_))));
        assert!(sql.ping().await.is_err());
    }
}
