//! Action executor.
//!
//! A handler is an ordered list of actions; each runs to completion or fails
//! locally. A failed action becomes an `error` event and the handler proceeds
//! to the next action — except a failed reply, which still produces a reply
//! (the fallback text), because the user must see something.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::{resolve_binds, BotRecord, DbError, SqlRunner};
use crate::error::{ErrorCode, RuntimeError};
use crate::events::{Event, EventSink, EventType};
use crate::i18n::I18nResolver;
use crate::llm::LlmService;
use crate::metrics::Metrics;
use crate::spec::{CalendarParams, KeyboardSpec};
use crate::sqlgate::{self, SqlMode};
use crate::template::{self, Scope};
use crate::widget::{self, Keyboard};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// One unit of side-effect, deserialized from the DSL's tagged dictionaries.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "action.sql_exec.v1")]
    SqlExec { sql: String },
    #[serde(rename = "action.sql_query.v1")]
    SqlQuery {
        sql: String,
        result_var: String,
        #[serde(default)]
        scalar: bool,
        #[serde(default)]
        flatten: bool,
    },
    #[serde(rename = "action.reply_template.v1")]
    ReplyTemplate {
        text: String,
        #[serde(default)]
        empty_text: Option<String>,
        #[serde(default)]
        keyboard: Option<KeyboardSpec>,
        #[serde(default)]
        llm_improve: bool,
    },
    #[serde(rename = "widget.calendar.v1")]
    Calendar(CalendarParams),
}

impl Action {
    /// Label for `dsl_action_latency_ms{action}`.
    pub fn label(&self) -> &'static str {
        match self {
            Action::SqlExec { .. } => "sql_exec",
            Action::SqlQuery { .. } => "sql_query",
            Action::ReplyTemplate { .. } => "reply_template",
            Action::Calendar(_) => "widget_calendar",
        }
    }
}

/// Reply artifact: text plus optional inline keyboard.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            keyboard: None,
        }
    }
}

/// What a handler produced.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub replies: Vec<Reply>,
}

/// Identity of the update being handled; threaded through every event.
#[derive(Clone, Copy)]
pub struct ActionCtx<'a> {
    pub bot: &'a BotRecord,
    pub user_id: Option<i64>,
    pub chat_id: Option<i64>,
    pub trace_id: Uuid,
}

/// Runs actions against the shared services. One per process, owned by the
/// runtime.
pub struct Executor {
    runner: Arc<dyn SqlRunner>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    i18n: I18nResolver,
    llm: Arc<LlmService>,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn SqlRunner>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        i18n: I18nResolver,
        llm: Arc<LlmService>,
    ) -> Self {
        Self {
            runner,
            events,
            metrics,
            i18n,
            llm,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Record an error as event + counter. `component` is the `where` label.
    pub async fn emit_error(&self, ctx: &ActionCtx<'_>, component: &str, code: ErrorCode) {
        self.metrics
            .errors_total
            .with_label_values(&[&ctx.bot.id.to_string(), component, code.as_str()])
            .inc();
        self.events
            .emit(Event::error(
                ctx.bot.id,
                ctx.user_id,
                ctx.trace_id,
                component,
                code,
            ))
            .await;
    }

    /// Run a handler's action list in order. Failures are recorded and the
    /// list keeps going; replies accumulate in order.
    pub async fn run_actions(
        &self,
        ctx: &ActionCtx<'_>,
        actions: &[Action],
        scope: &mut Scope,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        for action in actions {
            let started = std::time::Instant::now();
            let result = self.run_action(ctx, action, scope).await;
            self.metrics
                .action_latency_ms
                .with_label_values(&[action.label()])
                .observe(started.elapsed().as_secs_f64() * 1_000.0);
            match result {
                Ok(Some(reply)) => outcome.replies.push(reply),
                Ok(None) => {}
                Err(e) => {
                    let component = match e {
                        RuntimeError::DbUnavailable(_) => "db",
                        RuntimeError::Template(_) => "template",
                        _ => "sql",
                    };
                    tracing::warn!(bot_id = %ctx.bot.id, "action failed: {}", e);
                    self.emit_error(ctx, component, e.code()).await;
                }
            }
        }
        outcome
    }

    async fn run_action(
        &self,
        ctx: &ActionCtx<'_>,
        action: &Action,
        scope: &mut Scope,
    ) -> Result<Option<Reply>, RuntimeError> {
        match action {
            Action::SqlExec { sql } => self.sql_exec(ctx, sql, scope).await.map(|_| None),
            Action::SqlQuery {
                sql,
                result_var,
                scalar,
                flatten,
            } => self
                .sql_query(ctx, sql, result_var, *scalar, *flatten, scope)
                .await
                .map(|_| None),
            Action::ReplyTemplate {
                text,
                empty_text,
                keyboard,
                llm_improve,
            } => self
                .reply_template(ctx, text, empty_text.as_deref(), keyboard.as_ref(), *llm_improve, scope)
                .await
                .map(Some),
            Action::Calendar(params) => self.calendar(ctx, params).await.map(Some),
        }
    }

    /// Tenant boundary: spec SQL must bind `:bot_id` somewhere, so no
    /// statement can read or write across bots regardless of what the spec
    /// author wrote.
    fn check_tenant_scope(prepared: &sqlgate::PreparedSql) -> Result<(), RuntimeError> {
        if prepared.params.iter().any(|p| p == "bot_id") {
            Ok(())
        } else {
            Err(RuntimeError::Sql("sql_tenant_unscoped".into()))
        }
    }

    async fn sql_exec(
        &self,
        ctx: &ActionCtx<'_>,
        sql: &str,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        let hash = sqlgate::stable_hash(sql);
        let prepared = match sqlgate::validate(sql, SqlMode::Exec, scope) {
            Ok(p) => p,
            Err(e) => {
                self.sql_event(ctx, "exec", hash, false, json!({"error": e.to_string()}))
                    .await;
                return Err(RuntimeError::Sql(e.to_string()));
            }
        };
        if let Err(e) = Self::check_tenant_scope(&prepared) {
            self.sql_event(ctx, "exec", hash, false, json!({"error": "sql_tenant_unscoped"}))
                .await;
            return Err(e);
        }
        let binds = resolve_binds(&prepared.params, ctx.bot.id, ctx.user_id, scope);
        match self.runner.execute(&prepared.sql, &binds, EXEC_TIMEOUT).await {
            Ok(rows_affected) => {
                self.metrics
                    .sql_exec_total
                    .with_label_values(&[&ctx.bot.id.to_string()])
                    .inc();
                self.sql_event(
                    ctx,
                    "exec",
                    hash,
                    true,
                    json!({"rows_affected": rows_affected}),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.sql_event(ctx, "exec", hash, false, json!({"error": "execution failed"}))
                    .await;
                Err(db_to_runtime(e))
            }
        }
    }

    async fn sql_query(
        &self,
        ctx: &ActionCtx<'_>,
        sql: &str,
        result_var: &str,
        scalar: bool,
        flatten: bool,
        scope: &mut Scope,
    ) -> Result<(), RuntimeError> {
        let hash = sqlgate::stable_hash(sql);
        let prepared = match sqlgate::validate(sql, SqlMode::Query, scope) {
            Ok(p) => p,
            Err(e) => {
                self.sql_event(ctx, "query", hash, false, json!({"error": e.to_string()}))
                    .await;
                return Err(RuntimeError::Sql(e.to_string()));
            }
        };
        if let Err(e) = Self::check_tenant_scope(&prepared) {
            self.sql_event(ctx, "query", hash, false, json!({"error": "sql_tenant_unscoped"}))
                .await;
            return Err(e);
        }
        let binds = resolve_binds(&prepared.params, ctx.bot.id, ctx.user_id, scope);
        let rows = match self.runner.fetch(&prepared.sql, &binds, QUERY_TIMEOUT).await {
            Ok(rows) => rows,
            Err(e) => {
                self.sql_event(ctx, "query", hash, false, json!({"error": "query failed"}))
                    .await;
                return Err(db_to_runtime(e));
            }
        };
        self.metrics
            .sql_query_total
            .with_label_values(&[&ctx.bot.id.to_string()])
            .inc();
        self.sql_event(ctx, "query", hash, true, json!({"rows": rows.len()}))
            .await;

        let value = if scalar {
            rows.first()
                .and_then(|row| row.values().next().cloned())
                .unwrap_or(Value::Null)
        } else if flatten {
            let mut values = Vec::with_capacity(rows.len());
            for row in &rows {
                if row.len() != 1 {
                    return Err(RuntimeError::Sql(
                        "flatten requires exactly one column".into(),
                    ));
                }
                values.push(row.values().next().cloned().unwrap_or(Value::Null));
            }
            Value::Array(values)
        } else {
            Value::Array(rows.into_iter().map(Value::Object).collect())
        };
        scope.insert(result_var.to_string(), value);
        Ok(())
    }

    async fn sql_event(&self, ctx: &ActionCtx<'_>, mode: &str, hash: u64, success: bool, extra: Value) {
        let mut event = Event::new(ctx.bot.id, ctx.user_id, EventType::ActionSql, ctx.trace_id)
            .with("mode", mode)
            .with("sql_hash", format!("{hash:016x}"))
            .with("success", success);
        if let Value::Object(map) = extra {
            for (k, v) in map {
                event = event.with(&k, v);
            }
        }
        self.events.emit(event).await;
    }

    async fn reply_template(
        &self,
        ctx: &ActionCtx<'_>,
        text: &str,
        empty_text: Option<&str>,
        keyboard: Option<&KeyboardSpec>,
        llm_improve: bool,
        scope: &Scope,
    ) -> Result<Reply, RuntimeError> {
        let resolved = self
            .i18n
            .resolve(ctx.bot.id, &ctx.bot.default_locale, ctx.user_id, ctx.chat_id, text)
            .await;
        let resolved_empty = match empty_text {
            Some(t) => Some(
                self.i18n
                    .resolve(ctx.bot.id, &ctx.bot.default_locale, ctx.user_id, ctx.chat_id, t)
                    .await,
            ),
            None => None,
        };

        let (mut rendered, render_ok) =
            match template::render(&resolved, scope, resolved_empty.as_deref()) {
                Ok(out) => (out, true),
                Err(e) => {
                    self.emit_error(ctx, "template", ErrorCode::TemplateError).await;
                    (e.fallback, false)
                }
            };

        let mut improved = false;
        let mut cached = false;
        if render_ok && llm_improve {
            if let Some(user_id) = ctx.user_id {
                let outcome = self
                    .llm
                    .improve(ctx.bot, user_id, &rendered, &self.metrics)
                    .await;
                improved = outcome.improved;
                cached = outcome.cached;
                if let Some(code) = outcome.refusal {
                    self.emit_error(ctx, "llm", code).await;
                } else if let Some(failure) = &outcome.failure {
                    self.events
                        .emit(
                            Event::new(ctx.bot.id, ctx.user_id, EventType::LlmImprove, ctx.trace_id)
                                .with("success", false)
                                .with("error", failure.as_str()),
                        )
                        .await;
                } else if outcome.improved {
                    self.events
                        .emit(
                            Event::new(ctx.bot.id, ctx.user_id, EventType::LlmImprove, ctx.trace_id)
                                .with("success", true)
                                .with("cached", cached),
                        )
                        .await;
                }
                rendered = outcome.text;
            }
        }

        self.events
            .emit(
                Event::new(ctx.bot.id, ctx.user_id, EventType::ActionReply, ctx.trace_id)
                    .with("success", render_ok)
                    .with("len", rendered.chars().count())
                    .with("llm_improved", improved),
            )
            .await;

        Ok(Reply {
            text: rendered,
            keyboard: keyboard.map(KeyboardSpec::to_keyboard),
        })
    }

    async fn calendar(
        &self,
        ctx: &ActionCtx<'_>,
        params: &CalendarParams,
    ) -> Result<Reply, RuntimeError> {
        let Some(user_id) = ctx.user_id else {
            return Err(RuntimeError::Internal("calendar widget needs a user".into()));
        };
        let spec = compile_calendar(params)?;
        let (year, month) = widget::calendar::initial_month(&spec);
        let keyboard = widget::calendar::render_month(ctx.bot.id, user_id, &spec, year, month);
        self.metrics
            .widget_calendar_renders_total
            .with_label_values(&[&ctx.bot.id.to_string()])
            .inc();
        self.events
            .emit(
                Event::new(ctx.bot.id, ctx.user_id, EventType::WidgetRender, ctx.trace_id)
                    .with("widget", "calendar")
                    .with("month", format!("{year:04}-{month:02}")),
            )
            .await;
        Ok(Reply {
            text: spec
                .title
                .clone()
                .unwrap_or_else(|| "Выберите дату:".to_string()),
            keyboard: Some(keyboard),
        })
    }
}

/// Widget params reach the executor pre-validated by the spec compiler, but
/// standalone renders (preview, menu actions) still need the conversion.
pub fn compile_calendar(params: &CalendarParams) -> Result<widget::CalendarSpec, RuntimeError> {
    let mode = match params.mode.as_str() {
        "date" => widget::CalMode::Date,
        "datetime" => widget::CalMode::DateTime,
        other => {
            return Err(RuntimeError::Internal(format!(
                "unknown calendar mode {other}"
            )))
        }
    };
    let parse = |s: &Option<String>| {
        s.as_ref()
            .and_then(|raw| chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    };
    Ok(widget::CalendarSpec {
        mode,
        min: parse(&params.min),
        max: parse(&params.max),
        tz: params.tz.clone(),
        title: params.title.clone(),
    })
}

fn db_to_runtime(e: DbError) -> RuntimeError {
    match e {
        DbError::Unavailable(m) => RuntimeError::DbUnavailable(m),
        DbError::Query(m) => RuntimeError::Sql(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemorySql, Row, SqlOutcome, SqlValue};
    use crate::events::MemoryEventSink;
    use crate::llm::{LlmService, MockLlm};
    use crate::store::InMemoryKv;
    use serde_json::json;

    fn bot() -> BotRecord {
        BotRecord {
            id: Uuid::new_v4(),
            name: "b".into(),
            token: "t".into(),
            status: "active".into(),
            llm_enabled: true,
            llm_preset: "neutral".into(),
            daily_budget_limit: 0,
            default_locale: "ru".into(),
        }
    }

    fn llm_settings(enabled: bool) -> config::LlmSettings {
        config::LlmSettings {
            enabled,
            base_url: "http://unused".into(),
            model: "m".into(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            rate_limit: 100,
            cache_ttl: Duration::from_secs(900),
        }
    }

    struct Harness {
        executor: Executor,
        sql: Arc<InMemorySql>,
        events: Arc<MemoryEventSink>,
        llm: Arc<MockLlm>,
    }

    fn harness_with(sql: InMemorySql, llm_enabled: bool) -> Harness {
        let sql = Arc::new(sql);
        let events = Arc::new(MemoryEventSink::new());
        let llm = Arc::new(MockLlm::new());
        let service = Arc::new(LlmService::new(
            llm.clone(),
            Arc::new(InMemoryKv::new()),
            llm_settings(llm_enabled),
        ));
        let executor = Executor::new(
            sql.clone() as Arc<dyn crate::db::SqlRunner>,
            events.clone() as Arc<dyn EventSink>,
            Arc::new(Metrics::new()),
            I18nResolver::new(crate::db::Repo::new(sql.clone())),
            service,
        );
        Harness {
            executor,
            sql,
            events,
            llm,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemorySql::new(), false)
    }

    fn ctx<'a>(bot: &'a BotRecord, trace: Uuid) -> ActionCtx<'a> {
        ActionCtx {
            bot,
            user_id: Some(7),
            chat_id: Some(7),
            trace_id: trace,
        }
    }

    fn action(v: Value) -> Action {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn exec_binds_tenant_implicitly() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        scope.insert("service".into(), json!("massage"));
        let actions = [action(json!({
            "type": "action.sql_exec.v1",
            "sql": "INSERT INTO bookings (bot_id, user_id, service) VALUES (:bot_id, :user_id, :service)"
        }))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert!(out.replies.is_empty());
        let (stmt, binds) = h.sql.statements().pop().unwrap();
        assert!(stmt.contains("$1") && stmt.contains("$2") && stmt.contains("$3"));
        assert_eq!(binds[0], SqlValue::Uuid(b.id));
        assert_eq!(binds[1], SqlValue::Int(7));
        assert_eq!(binds[2], SqlValue::Text("massage".into()));
        assert_eq!(h.events.types(), vec![EventType::ActionSql]);
    }

    #[tokio::test]
    async fn query_result_shapes() {
        let sql = InMemorySql::with_handler(|stmt, _| {
            if stmt.contains("one_col") {
                let mut rows = Vec::new();
                for v in ["a", "b"] {
                    let mut r = Row::new();
                    r.insert("name".into(), json!(v));
                    rows.push(r);
                }
                Ok(SqlOutcome::Rows(rows))
            } else {
                let mut r = Row::new();
                r.insert("n".into(), json!(42));
                r.insert("extra".into(), json!("x"));
                Ok(SqlOutcome::Rows(vec![r]))
            }
        });
        let h = harness_with(sql, false);
        let b = bot();
        let mut scope = Scope::new();

        let actions = [
            action(json!({"type": "action.sql_query.v1",
                "sql": "SELECT n, extra FROM t WHERE bot_id = :bot_id", "result_var": "rows"})),
            action(json!({"type": "action.sql_query.v1",
                "sql": "SELECT n, extra FROM t WHERE bot_id = :bot_id", "result_var": "first", "scalar": true})),
            action(json!({"type": "action.sql_query.v1",
                "sql": "SELECT one_col FROM t WHERE bot_id = :bot_id", "result_var": "names", "flatten": true})),
        ];
        h.executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;

        assert_eq!(scope["rows"], json!([{"n": 42, "extra": "x"}]));
        assert_eq!(scope["first"], json!(42));
        assert_eq!(scope["names"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn scalar_of_empty_result_is_null() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.sql_query.v1",
            "sql": "SELECT n FROM t WHERE bot_id = :bot_id", "result_var": "v", "scalar": true}))];
        h.executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(scope["v"], Value::Null);
    }

    #[tokio::test]
    async fn gate_rejection_fails_locally_and_handler_continues() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [
            action(json!({"type": "action.sql_exec.v1", "sql": "DROP TABLE bots"})),
            action(json!({"type": "action.reply_template.v1", "text": "still here"})),
        ];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies, vec![Reply::text("still here")]);
        // rejected statement never reached the runner
        assert!(h.sql.statements().is_empty());
        let types = h.events.types();
        assert!(types.contains(&EventType::Error));
        let error = h
            .events
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::Error)
            .unwrap();
        assert_eq!(error.data["code"], "sql_error");
    }

    #[tokio::test]
    async fn unscoped_sql_never_reaches_the_runner() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [
            action(json!({"type": "action.sql_query.v1",
                "sql": "SELECT user_id FROM bot_users", "result_var": "leak"})),
            action(json!({"type": "action.sql_exec.v1",
                "sql": "DELETE FROM bookings"})),
        ];
        h.executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert!(h.sql.statements().is_empty());
        assert!(!scope.contains_key("leak"));
        let errors: Vec<_> = h
            .events
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::Error)
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn db_outage_is_reported_as_db_unavailable() {
        let sql = InMemorySql::new();
        sql.set_unavailable(true);
        let h = harness_with(sql, false);
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.sql_query.v1",
            "sql": "SELECT n FROM t WHERE bot_id = :bot_id", "result_var": "x"}))];
        h.executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        let error = h
            .events
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::Error)
            .unwrap();
        assert_eq!(error.data["code"], "db_unavailable");
        assert_eq!(error.data["where"], "db");
    }

    #[tokio::test]
    async fn reply_renders_scope_and_records_length() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        scope.insert("name".into(), json!("Ann"));
        let actions = [action(json!({"type": "action.reply_template.v1", "text": "Hi {{name}}!"}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "Hi Ann!");
        let reply_event = h
            .events
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::ActionReply)
            .unwrap();
        assert_eq!(reply_event.data["success"], true);
        assert_eq!(reply_event.data["len"], json!("Hi Ann!".chars().count()));
    }

    #[tokio::test]
    async fn template_failure_replies_with_fallback() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.reply_template.v1",
            "text": "a {{#if x}}b{{/if}} c"}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "a b c");
        let error = h
            .events
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::Error)
            .unwrap();
        assert_eq!(error.data["code"], "template_error");
        let reply_event = h
            .events
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::ActionReply)
            .unwrap();
        assert_eq!(reply_event.data["success"], false);
    }

    #[tokio::test]
    async fn empty_text_used_for_empty_lists() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        scope.insert("items".into(), json!([]));
        let actions = [action(json!({"type": "action.reply_template.v1",
            "text": "{{#each items}}{{name}}{{/each}}", "empty_text": "Пока пусто"}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "Пока пусто");
    }

    #[tokio::test]
    async fn llm_improvement_applies_when_enabled() {
        let h = harness_with(InMemorySql::new(), true);
        h.llm.push_ok("polished", 10);
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.reply_template.v1",
            "text": "raw", "llm_improve": true}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "polished");
        assert!(h.events.types().contains(&EventType::LlmImprove));
    }

    #[tokio::test]
    async fn llm_failure_keeps_rendered_text() {
        let h = harness_with(InMemorySql::new(), true);
        h.llm.push_err(crate::llm::LlmFailure::Upstream(500));
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.reply_template.v1",
            "text": "raw", "llm_improve": true}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "raw");
    }

    #[tokio::test]
    async fn keyboard_attached_to_reply() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "action.reply_template.v1",
            "text": "pick", "keyboard": [[{"text": "Yes", "callback_data": "yes"}]]}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        let kb = out.replies[0].keyboard.as_ref().unwrap();
        assert_eq!(kb.rows[0][0].callback_data, "yes");
    }

    #[tokio::test]
    async fn calendar_action_renders_grid() {
        let h = harness();
        let b = bot();
        let mut scope = Scope::new();
        let actions = [action(json!({"type": "widget.calendar.v1",
            "mode": "date", "title": "Когда?"}))];
        let out = h
            .executor
            .run_actions(&ctx(&b, Uuid::new_v4()), &actions, &mut scope)
            .await;
        assert_eq!(out.replies[0].text, "Когда?");
        assert!(out.replies[0].keyboard.is_some());
        assert!(h.events.types().contains(&EventType::WidgetRender));
    }

    #[tokio::test]
    async fn events_share_the_trace_id() {
        let h = harness();
        let b = bot();
        let trace = Uuid::new_v4();
        let mut scope = Scope::new();
        let actions = [
            action(json!({"type": "action.sql_query.v1",
                "sql": "SELECT n FROM t WHERE bot_id = :bot_id", "result_var": "x"})),
            action(json!({"type": "action.reply_template.v1", "text": "done"})),
        ];
        h.executor.run_actions(&ctx(&b, trace), &actions, &mut scope).await;
        for e in h.events.events() {
            assert_eq!(e.data["trace_id"], trace.to_string());
        }
    }
}
