//! Shared key/value store.
//!
//! Holds wizard state, the LLM prompt cache, rate-limit windows, and daily
//! token budgets. The authoritative copy always lives here; in-process
//! concurrency is resolved with compare-and-swap, not local locks.

mod in_memory;
mod redis_kv;

pub use in_memory::InMemoryKv;
pub use redis_kv::RedisKv;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// Transport down or pool exhausted; surfaces as `db_unavailable`.
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv store error: {0}")]
    Other(String),
}

/// Key/value store with TTL, CAS, and counters.
///
/// Values are opaque strings (the wizard layer stores JSON). Keys are always
/// prefixed with the owning tenant's bot_id by the caller.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Set `key` to `new` only when the current value equals `expected`
    /// (`None` = key must be absent). Returns whether the swap won.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Atomically add `by` to an integer counter, creating it with `ttl` when
    /// absent. Returns the counter value after the add.
    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, KvError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), KvError>;
}
