//! LLM service: cache, rate limit, budget, and breaker around the client.
//!
//! Order per request: rate limit → budget → cache → breaker → upstream.
//! Rate-limit refusals never touch the breaker's failure counters, and cache
//! hits never touch the upstream latency numbers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::breaker::{Admission, BreakerState, CircuitBreaker};
use super::client::{LlmClient, LlmFailure};
use crate::db::BotRecord;
use crate::error::ErrorCode;
use crate::metrics::Metrics;
use crate::store::KvStore;
use config::LlmSettings;

/// Result of an improvement attempt. `text` is always usable: refusals and
/// failures hand back the input unchanged.
#[derive(Clone, Debug)]
pub struct ImproveOutcome {
    pub text: String,
    pub improved: bool,
    pub cached: bool,
    /// Refusal before reaching the upstream (breaker / rate limit / budget).
    pub refusal: Option<ErrorCode>,
    /// Upstream failure description, for the event log.
    pub failure: Option<String>,
}

impl ImproveOutcome {
    fn unchanged(text: &str) -> Self {
        ImproveOutcome {
            text: text.to_string(),
            improved: false,
            cached: false,
            refusal: None,
            failure: None,
        }
    }

    fn refused(text: &str, code: ErrorCode) -> Self {
        ImproveOutcome {
            refusal: Some(code),
            ..Self::unchanged(text)
        }
    }
}

pub struct LlmService {
    client: Arc<dyn LlmClient>,
    kv: Arc<dyn KvStore>,
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
    settings: LlmSettings,
}

impl LlmService {
    pub fn new(client: Arc<dyn LlmClient>, kv: Arc<dyn KvStore>, settings: LlmSettings) -> Self {
        Self {
            client,
            kv,
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn breaker_state(&self, bot_id: Uuid) -> BreakerState {
        self.breaker(bot_id).state()
    }

    /// Whether any bot's breaker is currently open (degraded-mode health).
    pub fn any_breaker_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|entry| entry.value().state() == BreakerState::Open)
    }

    fn breaker(&self, bot_id: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(bot_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new()))
            .clone()
    }

    fn cache_key(&self, preset: &str, text: &str) -> String {
        let hash = fxhash::hash64(&format!("{}\n{}\n{}", self.settings.model, preset, text));
        format!("llm:cache:{hash:016x}")
    }

    async fn rate_limited(&self, bot_id: Uuid, user_id: i64) -> bool {
        let minute = Utc::now().timestamp() / 60;
        let key = format!("llm:rl:{bot_id}:{user_id}:{minute}");
        match self.kv.incr(&key, 1, Some(Duration::from_secs(120))).await {
            Ok(count) => count > self.settings.rate_limit as i64,
            Err(e) => {
                // fail open: a store outage must not block replies
                tracing::warn!("rate limit store error: {}", e);
                false
            }
        }
    }

    fn budget_key(bot_id: Uuid) -> String {
        format!("llm:budget:{}:{}", bot_id, Utc::now().format("%Y%m%d"))
    }

    async fn budget_exhausted(&self, bot: &BotRecord) -> bool {
        if bot.daily_budget_limit <= 0 {
            return false;
        }
        let spent = match self.kv.get(&Self::budget_key(bot.id)).await {
            Ok(Some(v)) => v.parse::<i64>().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!("budget store error: {}", e);
                0
            }
        };
        spent >= bot.daily_budget_limit
    }

    async fn charge_budget(&self, bot_id: Uuid, tokens: u32) {
        if tokens == 0 {
            return;
        }
        // the key expires well after the UTC day boundary it encodes
        if let Err(e) = self
            .kv
            .incr(
                &Self::budget_key(bot_id),
                tokens as i64,
                Some(Duration::from_secs(2 * 86_400)),
            )
            .await
        {
            tracing::warn!("budget store error: {}", e);
        }
    }

    /// Improve `text` for a reply. Never fails the reply: whatever happens,
    /// the returned text is usable.
    pub async fn improve(
        &self,
        bot: &BotRecord,
        user_id: i64,
        text: &str,
        metrics: &Metrics,
    ) -> ImproveOutcome {
        if !self.settings.enabled || !bot.llm_enabled || text.is_empty() {
            return ImproveOutcome::unchanged(text);
        }
        let bot_label = bot.id.to_string();
        let model = self.settings.model.as_str();

        if self.rate_limited(bot.id, user_id).await {
            metrics
                .llm_requests_total
                .with_label_values(&["improve", "rate_limited"])
                .inc();
            return ImproveOutcome::refused(text, ErrorCode::RateLimitExceeded);
        }

        if self.budget_exhausted(bot).await {
            metrics
                .llm_requests_total
                .with_label_values(&["improve", "budget_exhausted"])
                .inc();
            return ImproveOutcome::refused(text, ErrorCode::BudgetExhausted);
        }

        let cache_key = self.cache_key(&bot.llm_preset, text);
        if let Ok(Some(cached)) = self.kv.get(&cache_key).await {
            metrics.llm_cache_hits_total.with_label_values(&[model]).inc();
            metrics
                .llm_latency_ms
                .with_label_values(&["improve", "true"])
                .observe(0.0);
            return ImproveOutcome {
                text: cached,
                improved: true,
                cached: true,
                refusal: None,
                failure: None,
            };
        }

        let breaker = self.breaker(bot.id);
        let (admission, transition) = breaker.admit();
        if let Some(state) = transition {
            metrics
                .breaker_state_changes_total
                .with_label_values(&[&bot_label, state.as_str()])
                .inc();
        }
        if admission == Admission::Reject {
            metrics
                .breaker_rejections_total
                .with_label_values(&[&bot_label])
                .inc();
            metrics
                .llm_requests_total
                .with_label_values(&["improve", "breaker_open"])
                .inc();
            return ImproveOutcome::refused(text, ErrorCode::CircuitBreakerOpen);
        }

        let started = std::time::Instant::now();
        match self.client.improve(text, &bot.llm_preset).await {
            Ok(reply) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                if let Some(state) = breaker.record_success() {
                    metrics
                        .breaker_state_changes_total
                        .with_label_values(&[&bot_label, state.as_str()])
                        .inc();
                }
                metrics
                    .llm_requests_total
                    .with_label_values(&["improve", "ok"])
                    .inc();
                metrics
                    .llm_latency_ms
                    .with_label_values(&["improve", "false"])
                    .observe(elapsed_ms);
                if let Some(usage) = reply.usage {
                    metrics
                        .llm_tokens_total
                        .with_label_values(&[model, "prompt"])
                        .inc_by(usage.prompt_tokens as u64);
                    metrics
                        .llm_tokens_total
                        .with_label_values(&[model, "completion"])
                        .inc_by(usage.completion_tokens as u64);
                    self.charge_budget(bot.id, usage.total_tokens).await;
                }
                if let Err(e) = self
                    .kv
                    .set(&cache_key, &reply.text, Some(self.settings.cache_ttl))
                    .await
                {
                    tracing::warn!("llm cache write failed: {}", e);
                }
                ImproveOutcome {
                    text: reply.text,
                    improved: true,
                    cached: false,
                    refusal: None,
                    failure: None,
                }
            }
            Err(failure) => {
                metrics
                    .llm_requests_total
                    .with_label_values(&["improve", "error"])
                    .inc();
                metrics
                    .llm_errors_total
                    .with_label_values(&[model, failure.error_type()])
                    .inc();
                if matches!(failure, LlmFailure::Timeout) {
                    metrics
                        .llm_timeout_total
                        .with_label_values(&[&bot_label])
                        .inc();
                }
                if failure.counts_for_breaker() {
                    if let Some(state) = breaker.record_failure() {
                        metrics
                            .breaker_state_changes_total
                            .with_label_values(&[&bot_label, state.as_str()])
                            .inc();
                    }
                } else if breaker.state() == BreakerState::HalfOpen {
                    // a non-counting failure still ends the probe
                    breaker.record_failure();
                }
                ImproveOutcome {
                    failure: Some(failure.to_string()),
                    ..ImproveOutcome::unchanged(text)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::MockLlm;
    use crate::store::InMemoryKv;

    fn settings(rate_limit: u32) -> LlmSettings {
        LlmSettings {
            enabled: true,
            base_url: "http://unused".into(),
            model: "test-model".into(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            rate_limit,
            cache_ttl: Duration::from_secs(900),
        }
    }

    fn bot(budget: i64) -> BotRecord {
        BotRecord {
            id: Uuid::new_v4(),
            name: "b".into(),
            token: "t".into(),
            status: "active".into(),
            llm_enabled: true,
            llm_preset: "neutral".into(),
            daily_budget_limit: budget,
            default_locale: "ru".into(),
        }
    }

    fn service(client: Arc<MockLlm>, rate_limit: u32) -> LlmService {
        LlmService::new(client, Arc::new(InMemoryKv::new()), settings(rate_limit))
    }

    #[tokio::test]
    async fn disabled_bot_is_untouched() {
        let client = Arc::new(MockLlm::new());
        let svc = service(client.clone(), 10);
        let mut b = bot(0);
        b.llm_enabled = false;
        let out = svc.improve(&b, 1, "hello", &Metrics::new()).await;
        assert_eq!(out.text, "hello");
        assert!(!out.improved);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn cache_hit_suppresses_second_call() {
        let client = Arc::new(MockLlm::new());
        let svc = service(client.clone(), 10);
        let b = bot(0);
        let m = Metrics::new();

        let first = svc.improve(&b, 1, "hello", &m).await;
        assert!(first.improved && !first.cached);
        let second = svc.improve(&b, 1, "hello", &m).await;
        assert!(second.improved && second.cached);
        assert_eq!(second.text, first.text);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn five_failures_open_the_breaker_sixth_is_rejected() {
        let client = Arc::new(MockLlm::new());
        for _ in 0..5 {
            client.push_err(LlmFailure::Upstream(500));
        }
        let svc = service(client.clone(), 100);
        let b = bot(0);
        let m = Metrics::new();

        // distinct texts so the cache stays out of the way
        for i in 0..5 {
            let out = svc.improve(&b, 1, &format!("msg {i}"), &m).await;
            assert_eq!(out.text, format!("msg {i}"));
            assert!(out.failure.is_some());
        }
        let sixth = svc.improve(&b, 1, "msg 5", &m).await;
        assert_eq!(sixth.refusal, Some(ErrorCode::CircuitBreakerOpen));
        assert_eq!(sixth.text, "msg 5");
        assert_eq!(client.calls(), 5);
        assert_eq!(svc.breaker_state(b.id), BreakerState::Open);
    }

    #[tokio::test]
    async fn non_breaker_failures_do_not_trip() {
        let client = Arc::new(MockLlm::new());
        for _ in 0..6 {
            client.push_err(LlmFailure::Upstream(429));
        }
        let svc = service(client.clone(), 100);
        let b = bot(0);
        let m = Metrics::new();
        for i in 0..6 {
            let out = svc.improve(&b, 1, &format!("m{i}"), &m).await;
            assert!(out.refusal.is_none());
        }
        assert_eq!(svc.breaker_state(b.id), BreakerState::Closed);
    }

    #[tokio::test]
    async fn rate_limit_refuses_without_touching_breaker() {
        let client = Arc::new(MockLlm::new());
        let svc = service(client.clone(), 2);
        let b = bot(0);
        let m = Metrics::new();

        assert!(svc.improve(&b, 1, "a", &m).await.refusal.is_none());
        assert!(svc.improve(&b, 1, "b", &m).await.refusal.is_none());
        let third = svc.improve(&b, 1, "c", &m).await;
        assert_eq!(third.refusal, Some(ErrorCode::RateLimitExceeded));
        assert_eq!(third.text, "c");
        assert_eq!(client.calls(), 2);
        assert_eq!(svc.breaker_state(b.id), BreakerState::Closed);
    }

    #[tokio::test]
    async fn budget_exhaustion_refuses_after_spend() {
        let client = Arc::new(MockLlm::new());
        client.push_ok("improved", 50);
        let svc = service(client.clone(), 100);
        let b = bot(40);
        let m = Metrics::new();

        let first = svc.improve(&b, 1, "x", &m).await;
        assert!(first.improved);
        // 50 tokens charged against a 40-token budget
        let second = svc.improve(&b, 1, "y", &m).await;
        assert_eq!(second.refusal, Some(ErrorCode::BudgetExhausted));
        assert_eq!(second.text, "y");
        assert_eq!(client.calls(), 1);
    }
}
