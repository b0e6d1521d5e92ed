//! Prometheus metrics.
//!
//! One `Metrics` value per process, owned by the runtime and passed by
//! reference (no global registry). Metric and label names are stable; the
//! serve layer exposes [`Metrics::gather_text`] on `/metrics`.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
    30_000.0,
];

pub struct Metrics {
    registry: Registry,

    pub updates_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub dsl_handle_latency_ms: Histogram,
    pub webhook_latency_ms: Histogram,
    pub sql_query_total: IntCounterVec,
    pub sql_exec_total: IntCounterVec,
    pub action_latency_ms: HistogramVec,

    pub llm_requests_total: IntCounterVec,
    pub llm_latency_ms: HistogramVec,
    pub llm_tokens_total: IntCounterVec,
    pub llm_cache_hits_total: IntCounterVec,
    pub llm_errors_total: IntCounterVec,
    pub llm_timeout_total: IntCounterVec,
    pub breaker_state_changes_total: IntCounterVec,
    pub breaker_rejections_total: IntCounterVec,

    pub widget_calendar_renders_total: IntCounterVec,
    pub widget_calendar_picks_total: IntCounterVec,

    pub broadcast_sent_total: IntCounterVec,
    pub broadcast_failed_total: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
    registry.register(Box::new(c.clone())).expect("unique metric");
    c
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
    )
    .expect("valid histogram opts");
    registry.register(Box::new(h.clone())).expect("unique metric");
    h
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .expect("valid histogram opts");
    registry.register(Box::new(h.clone())).expect("unique metric");
    h
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let r = Registry::new();
        Metrics {
            updates_total: counter(&r, "bot_updates_total", "Inbound updates", &["bot_id"]),
            errors_total: counter(
                &r,
                "bot_errors_total",
                "Errors by component and code",
                &["bot_id", "where", "code"],
            ),
            dsl_handle_latency_ms: histogram(
                &r,
                "dsl_handle_latency_ms",
                "Interpreter handling latency",
            ),
            webhook_latency_ms: histogram(&r, "webhook_latency_ms", "Webhook endpoint latency"),
            sql_query_total: counter(&r, "bot_sql_query_total", "Spec SQL queries", &["bot_id"]),
            sql_exec_total: counter(&r, "bot_sql_exec_total", "Spec SQL writes", &["bot_id"]),
            action_latency_ms: histogram_vec(
                &r,
                "dsl_action_latency_ms",
                "Per-action latency",
                &["action"],
            ),
            llm_requests_total: counter(
                &r,
                "llm_requests_total",
                "LLM requests",
                &["type", "status"],
            ),
            llm_latency_ms: histogram_vec(
                &r,
                "llm_latency_ms",
                "LLM latency (cache hits excluded from upstream numbers)",
                &["type", "cached"],
            ),
            llm_tokens_total: counter(&r, "llm_tokens_total", "Observed tokens", &["model", "type"]),
            llm_cache_hits_total: counter(&r, "llm_cache_hits_total", "Prompt cache hits", &["model"]),
            llm_errors_total: counter(
                &r,
                "llm_errors_total",
                "LLM failures",
                &["model", "error_type"],
            ),
            llm_timeout_total: counter(&r, "llm_timeout_total", "LLM timeouts", &["bot_id"]),
            breaker_state_changes_total: counter(
                &r,
                "circuit_breaker_state_changes_total",
                "Breaker transitions",
                &["bot_id", "to"],
            ),
            breaker_rejections_total: counter(
                &r,
                "llm_circuit_breaker_rejections_total",
                "Requests rejected while open",
                &["bot_id"],
            ),
            widget_calendar_renders_total: counter(
                &r,
                "widget_calendar_renders_total",
                "Calendar grids rendered",
                &["bot_id"],
            ),
            widget_calendar_picks_total: counter(
                &r,
                "widget_calendar_picks_total",
                "Calendar terminal picks",
                &["bot_id", "mode"],
            ),
            broadcast_sent_total: counter(
                &r,
                "broadcast_sent_total",
                "Broadcast messages sent",
                &["bot_id"],
            ),
            broadcast_failed_total: counter(
                &r,
                "broadcast_failed_total",
                "Broadcast deliveries failed",
                &["bot_id"],
            ),
            registry: r,
        }
    }

    /// Prometheus text exposition of everything registered.
    pub fn gather_text(&self) -> String {
        let families = self.registry.gather();
        TextEncoder::new()
            .encode_to_string(&families)
            .unwrap_or_default()
    }
}
