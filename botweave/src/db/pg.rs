//! Postgres `SqlRunner` over a bounded `sqlx` pool.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo};

use super::{DbError, Row, SqlRunner, SqlValue};

pub struct PgRunner {
    pool: PgPool,
}

impl PgRunner {
    /// Connect with a bounded pool. Acquisition failures surface as
    /// `db_unavailable`, so the acquire timeout stays short.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(map_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DbError::Unavailable(e.to_string())
        }
        other => DbError::Query(other.to_string()),
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for b in binds {
        query = match b {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::Timestamp(v) => query.bind(*v),
            SqlValue::Json(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_column(row: &PgRow, i: usize, ty: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, i: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(i).ok().flatten()
    }

    match ty {
        "BOOL" => get::<bool>(row, i).map(Value::Bool).unwrap_or(Value::Null),
        "INT2" => get::<i16>(row, i).map(|v| json!(v)).unwrap_or(Value::Null),
        "INT4" => get::<i32>(row, i).map(|v| json!(v)).unwrap_or(Value::Null),
        "INT8" => get::<i64>(row, i).map(|v| json!(v)).unwrap_or(Value::Null),
        "FLOAT4" => get::<f32>(row, i).map(|v| json!(v)).unwrap_or(Value::Null),
        "FLOAT8" => get::<f64>(row, i).map(|v| json!(v)).unwrap_or(Value::Null),
        "UUID" => get::<uuid::Uuid>(row, i)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, i)
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, i)
            .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        "DATE" => get::<chrono::NaiveDate>(row, i)
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => get::<Value>(row, i).unwrap_or(Value::Null),
        _ => get::<String>(row, i).map(Value::String).unwrap_or(Value::Null),
    }
}

fn row_to_json(row: &PgRow) -> Row {
    let mut out = Row::new();
    for col in row.columns() {
        let i = col.ordinal();
        out.insert(
            col.name().to_string(),
            decode_column(row, i, col.type_info().name()),
        );
    }
    out
}

#[async_trait]
impl SqlRunner for PgRunner {
    async fn fetch(
        &self,
        sql: &str,
        binds: &[SqlValue],
        timeout: Duration,
    ) -> Result<Vec<Row>, DbError> {
        let query = bind_all(sqlx::query(sql), binds);
        let rows = tokio::time::timeout(timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| DbError::Query("statement timeout".into()))?
            .map_err(map_err)?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(
        &self,
        sql: &str,
        binds: &[SqlValue],
        timeout: Duration,
    ) -> Result<u64, DbError> {
        let query = bind_all(sqlx::query(sql), binds);
        let result = tokio::time::timeout(timeout, query.execute(&self.pool))
            .await
            .map_err(|_| DbError::Query("statement timeout".into()))?
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_err)
    }
}
