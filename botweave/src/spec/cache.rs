//! Per-bot cache of compiled specs.
//!
//! The cache holds an `Arc<CompiledSpec>` per bot and swaps it atomically on
//! reload; handlers that already cloned the reference finish against the spec
//! they observed. No intrinsic TTL: invalidation is explicit.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::compile::{compile, CompiledSpec};
use crate::db::{DbError, Repo};
use crate::error::RuntimeError;

/// Where spec documents come from: the highest published version per bot.
#[async_trait]
pub trait SpecSource: Send + Sync {
    async fn latest(&self, bot_id: Uuid) -> Result<Option<(i64, Value)>, DbError>;
}

#[async_trait]
impl SpecSource for Repo {
    async fn latest(&self, bot_id: Uuid) -> Result<Option<(i64, Value)>, DbError> {
        self.latest_spec(bot_id).await
    }
}

pub struct SpecCache {
    source: Arc<dyn SpecSource>,
    cache: DashMap<Uuid, Arc<CompiledSpec>>,
}

impl SpecCache {
    pub fn new(source: Arc<dyn SpecSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    /// Cached spec, compiling synchronously on first request for a bot.
    pub async fn get(&self, bot_id: Uuid) -> Result<Option<Arc<CompiledSpec>>, RuntimeError> {
        if let Some(cached) = self.cache.get(&bot_id) {
            return Ok(Some(cached.clone()));
        }
        self.fetch_and_store(bot_id).await
    }

    /// Recompile from the current highest published version and swap the
    /// reference. Idempotent for an unchanged version.
    pub async fn reload(&self, bot_id: Uuid) -> Result<Option<Arc<CompiledSpec>>, RuntimeError> {
        self.fetch_and_store(bot_id).await
    }

    pub fn invalidate(&self, bot_id: Uuid) {
        self.cache.remove(&bot_id);
    }

    /// Spec version currently cached, if any (used by admin introspection).
    pub fn cached_version(&self, bot_id: Uuid) -> Option<i64> {
        self.cache.get(&bot_id).map(|s| s.version)
    }

    async fn fetch_and_store(
        &self,
        bot_id: Uuid,
    ) -> Result<Option<Arc<CompiledSpec>>, RuntimeError> {
        let fetched = self.source.latest(bot_id).await.map_err(|e| match e {
            DbError::Unavailable(m) => RuntimeError::DbUnavailable(m),
            DbError::Query(m) => RuntimeError::Sql(m),
        })?;
        let Some((version, doc)) = fetched else {
            self.cache.remove(&bot_id);
            return Ok(None);
        };
        let compiled = compile(&doc, version).map_err(|problems| {
            RuntimeError::Internal(format!(
                "spec v{version} failed to compile: {}",
                problems
                    .iter()
                    .map(|p| p.describe())
                    .collect::<Vec<_>>()
                    .join("; ")
            ))
        })?;
        let arc = Arc::new(compiled);
        self.cache.insert(bot_id, arc.clone());
        Ok(Some(arc))
    }
}
