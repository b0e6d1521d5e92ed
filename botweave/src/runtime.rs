//! Top-level runtime: owns every process-wide singleton and wires the
//! subsystems together. No globals; the serve layer holds one `Arc<Runtime>`
//! and passes references down.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::Executor;
use crate::broadcast::BroadcastEngine;
use crate::db::{PgRunner, Repo, SqlRunner};
use crate::error::RuntimeError;
use crate::events::{EventSink, PgEventSink};
use crate::i18n::I18nResolver;
use crate::interp::Interpreter;
use crate::llm::{HttpLlm, LlmClient, LlmService};
use crate::metrics::Metrics;
use crate::outbound::{Outbound, TelegramOutbound};
use crate::spec::SpecCache;
use crate::store::{KvStore, RedisKv};
use crate::wizard::WizardStore;
use config::Settings;

const DB_POOL_SIZE: u32 = 10;

pub struct Runtime {
    pub settings: Settings,
    pub metrics: Arc<Metrics>,
    pub sql: Arc<dyn SqlRunner>,
    pub kv: Arc<dyn KvStore>,
    pub repo: Repo,
    pub events: Arc<dyn EventSink>,
    pub specs: Arc<SpecCache>,
    pub llm: Arc<LlmService>,
    pub interp: Arc<Interpreter>,
    pub broadcasts: Arc<BroadcastEngine>,
    pub outbound: Arc<dyn Outbound>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Production wiring: Postgres, Redis, HTTP LLM, Telegram delivery.
    pub async fn connect(settings: Settings) -> Result<Arc<Self>, RuntimeError> {
        let sql: Arc<dyn SqlRunner> = Arc::new(
            PgRunner::connect(&settings.database_url, DB_POOL_SIZE)
                .await
                .map_err(|e| RuntimeError::DbUnavailable(e.to_string()))?,
        );
        let kv: Arc<dyn KvStore> = Arc::new(
            RedisKv::connect(&settings.redis_url)
                .await
                .map_err(|e| RuntimeError::DbUnavailable(e.to_string()))?,
        );
        let llm_client: Arc<dyn LlmClient> = Arc::new(HttpLlm::new(
            &settings.llm.base_url,
            &settings.llm.model,
            settings.llm.timeout,
            settings.llm.max_retries,
        ));
        let outbound: Arc<dyn Outbound> = Arc::new(TelegramOutbound::new());
        Ok(Self::assemble(settings, sql, kv, llm_client, outbound))
    }

    /// Trait-injected wiring; tests and the preview sandbox swap any seam.
    pub fn assemble(
        settings: Settings,
        sql: Arc<dyn SqlRunner>,
        kv: Arc<dyn KvStore>,
        llm_client: Arc<dyn LlmClient>,
        outbound: Arc<dyn Outbound>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let repo = Repo::new(sql.clone());
        let events: Arc<dyn EventSink> = Arc::new(PgEventSink::new(
            sql.clone(),
            settings.mask_sensitive_data,
        ));
        let i18n = I18nResolver::new(repo.clone());
        let llm = Arc::new(LlmService::new(llm_client, kv.clone(), settings.llm.clone()));
        let executor = Arc::new(Executor::new(
            sql.clone(),
            events.clone(),
            metrics.clone(),
            i18n.clone(),
            llm.clone(),
        ));
        let specs = Arc::new(SpecCache::new(Arc::new(repo.clone())));
        let interp = Arc::new(Interpreter::new(
            executor,
            specs.clone(),
            WizardStore::new(kv.clone()),
            repo.clone(),
        ));
        let shutdown = CancellationToken::new();
        let broadcasts = Arc::new(BroadcastEngine::new(
            repo.clone(),
            outbound.clone(),
            events.clone(),
            metrics.clone(),
            i18n,
            shutdown.clone(),
        ));
        Arc::new(Runtime {
            settings,
            metrics,
            sql,
            kv,
            repo,
            events,
            specs,
            llm,
            interp,
            broadcasts,
            outbound,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background loops: broadcast resumption and, when configured,
    /// the event retention sweeper.
    pub async fn start_background(&self) {
        match self.broadcasts.resume_pending().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("resumed {n} broadcasts"),
            Err(e) => tracing::warn!("broadcast resumption sweep failed: {}", e),
        }

        if let Some(days) = self.settings.events_retention_days {
            let repo = self.repo.clone();
            let shutdown = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(3_600));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
                    match repo.delete_events_before(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("retention sweep removed {n} events"),
                        Err(e) => tracing::warn!("retention sweep failed: {}", e),
                    }
                }
            });
            self.tasks.lock().expect("task list lock").push(handle);
        }
    }

    /// Cooperative shutdown: broadcasts park as resumable, loops exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.tasks.lock().expect("task list lock").drain(..) {
            handle.abort();
        }
    }

    // ---- health probes ----

    pub async fn pg_ok(&self) -> bool {
        self.sql.ping().await.is_ok()
    }

    pub async fn redis_ok(&self) -> bool {
        self.kv.ping().await.is_ok()
    }

    /// Degraded-mode health: unhealthy only while a breaker is open for some
    /// bot. A disabled LLM is healthy by definition.
    pub fn llm_ok(&self) -> bool {
        !self.settings.llm.enabled || !self.llm.any_breaker_open()
    }

    /// Reload one bot's spec; returns the new compiled version.
    pub async fn reload_spec(&self, bot_id: Uuid) -> Result<Option<i64>, RuntimeError> {
        Ok(self.specs.reload(bot_id).await?.map(|s| s.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemorySql;
    use crate::llm::MockLlm;
    use crate::outbound::NullOutbound;
    use crate::store::InMemoryKv;

    fn settings() -> Settings {
        Settings {
            database_url: "postgres://unused".into(),
            redis_url: "redis://unused".into(),
            llm: config::LlmSettings {
                enabled: false,
                base_url: String::new(),
                model: "m".into(),
                timeout: std::time::Duration::from_secs(30),
                max_retries: 0,
                rate_limit: 10,
                cache_ttl: std::time::Duration::from_secs(900),
            },
            log_level: "info".into(),
            events_retention_days: None,
            metrics_enabled: true,
            mask_sensitive_data: true,
            listen_addr: "127.0.0.1:0".into(),
        }
    }

    #[tokio::test]
    async fn assemble_and_probe_health() {
        let runtime = Runtime::assemble(
            settings(),
            Arc::new(InMemorySql::new()),
            Arc::new(InMemoryKv::new()),
            Arc::new(MockLlm::new()),
            Arc::new(NullOutbound::new()),
        );
        assert!(runtime.pg_ok().await);
        assert!(runtime.redis_ok().await);
        assert!(runtime.llm_ok());
        runtime.start_background().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn pg_outage_reflected_in_health() {
        let sql = Arc::new(InMemorySql::new());
        let runtime = Runtime::assemble(
            settings(),
            sql.clone(),
            Arc::new(InMemoryKv::new()),
            Arc::new(MockLlm::new()),
            Arc::new(NullOutbound::new()),
        );
        sql.set_unavailable(true);
        assert!(!runtime.pg_ok().await);
    }
}
