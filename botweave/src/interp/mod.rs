//! The DSL interpreter: routes one inbound update to a handler and runs it.
//!
//! Precedence, highest first: active wizard state, widget callback, menu flow
//! entry, wizard flow entry, intent, silence. Every update emits one `update`
//! event carrying `matched`; all events of the update share one trace id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::actions::{ActionCtx, Executor, Reply};
use crate::db::{BotRecord, Repo};
use crate::error::{ErrorCode, RuntimeError};
use crate::events::{Event, EventType};
use crate::spec::{CompiledSpec, SpecCache, WizardFlow, WizardStep};
use crate::template::Scope;
use crate::widget::{self, CalAction, CalMode};
use crate::wizard::{self, Loaded, WizardState, WizardStore};

/// Default per-update deadline.
pub const HANDLE_DEADLINE: Duration = Duration::from_secs(30);

/// Reply text when a handler dies or misses its deadline. Details never leak.
pub const GENERIC_ERROR_REPLY: &str = "Произошла ошибка, попробуйте позже";

/// One inbound update, already stripped to what the runtime needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Message {
        user_id: i64,
        chat_id: i64,
        text: String,
    },
    Callback {
        user_id: i64,
        data: String,
    },
}

impl Update {
    /// Parse a Telegram-shaped webhook body. Returns `None` for update kinds
    /// the runtime does not handle (edits, joins, …).
    pub fn from_webhook(body: &Value) -> Option<Update> {
        if let Some(cb) = body.get("callback_query") {
            return Some(Update::Callback {
                user_id: cb.get("from")?.get("id")?.as_i64()?,
                data: cb.get("data")?.as_str()?.to_string(),
            });
        }
        let message = body.get("message")?;
        Some(Update::Message {
            user_id: message.get("from")?.get("id")?.as_i64()?,
            chat_id: message
                .get("chat")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_i64)
                .or_else(|| message.get("from")?.get("id")?.as_i64())?,
            text: message.get("text")?.as_str()?.to_string(),
        })
    }

    pub fn user_id(&self) -> i64 {
        match self {
            Update::Message { user_id, .. } | Update::Callback { user_id, .. } => *user_id,
        }
    }

    fn chat_id(&self) -> Option<i64> {
        match self {
            Update::Message { chat_id, .. } => Some(*chat_id),
            Update::Callback { .. } => None,
        }
    }
}

/// Outcome of handling one update.
#[derive(Debug, Default)]
pub struct HandleResult {
    pub replies: Vec<Reply>,
    pub matched: bool,
}

impl HandleResult {
    fn silent() -> Self {
        HandleResult::default()
    }

    fn reply(reply: Reply) -> Self {
        HandleResult {
            replies: vec![reply],
            matched: true,
        }
    }
}

pub struct Interpreter {
    executor: Arc<Executor>,
    specs: Arc<SpecCache>,
    wizards: WizardStore,
    repo: Repo,
}

impl Interpreter {
    pub fn new(
        executor: Arc<Executor>,
        specs: Arc<SpecCache>,
        wizards: WizardStore,
        repo: Repo,
    ) -> Self {
        Self {
            executor,
            specs,
            wizards,
            repo,
        }
    }

    /// Handle one update under the default deadline. Never returns an error:
    /// failures become events and the generic error reply. The webhook path.
    pub async fn handle(&self, bot: &BotRecord, update: Update) -> HandleResult {
        match self.try_handle(bot, update).await {
            Ok(result) => result,
            Err(_) => HandleResult::reply(Reply::text(GENERIC_ERROR_REPLY)),
        }
    }

    /// Like [`Interpreter::handle`], but propagates the failure so callers
    /// with their own error surface (the preview tester) can report it.
    /// Events and metrics are recorded either way.
    pub async fn try_handle(
        &self,
        bot: &BotRecord,
        update: Update,
    ) -> Result<HandleResult, RuntimeError> {
        let trace_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        let metrics = self.executor.metrics();
        metrics
            .updates_total
            .with_label_values(&[&bot.id.to_string()])
            .inc();

        let ctx = ActionCtx {
            bot,
            user_id: Some(update.user_id()),
            chat_id: update.chat_id(),
            trace_id,
        };

        let outcome = tokio::time::timeout(HANDLE_DEADLINE, self.route(&ctx, bot, &update)).await;
        let result = match outcome {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => {
                let component = match e {
                    RuntimeError::DbUnavailable(_) => "db",
                    _ => "interp",
                };
                tracing::warn!(bot_id = %bot.id, "handler failed: {}", e);
                self.executor.emit_error(&ctx, component, e.code()).await;
                Err(e)
            }
            Err(_) => {
                self.executor.emit_error(&ctx, "interp", ErrorCode::Timeout).await;
                Err(RuntimeError::Timeout)
            }
        };

        metrics
            .dsl_handle_latency_ms
            .observe(started.elapsed().as_secs_f64() * 1_000.0);
        let matched = result.as_ref().map(|r| r.matched).unwrap_or(false);
        self.executor
            .events()
            .emit(
                Event::new(bot.id, ctx.user_id, EventType::Update, trace_id)
                    .with("matched", matched),
            )
            .await;
        result
    }

    async fn route(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        update: &Update,
    ) -> Result<HandleResult, RuntimeError> {
        let Some(spec) = self.specs.get(bot.id).await? else {
            return Ok(HandleResult::silent());
        };
        // activity tracking is best-effort; an outage must not kill the reply
        if let Err(e) = self.repo.touch_user(bot.id, update.user_id()).await {
            tracing::debug!("touch_user failed: {}", e);
        }

        match update {
            Update::Callback { user_id, data } => {
                self.route_callback(ctx, bot, &spec, *user_id, data).await
            }
            Update::Message { text, .. } => self.route_message(ctx, bot, &spec, update, text).await,
        }
    }

    async fn route_message(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        spec: &Arc<CompiledSpec>,
        update: &Update,
        text: &str,
    ) -> Result<HandleResult, RuntimeError> {
        let user_id = update.user_id();

        // 1. active wizard state
        match self.wizards.load(bot.id, user_id).await? {
            Loaded::Corrupt => {
                self.executor.emit_error(ctx, "wizard", ErrorCode::StateCorrupt).await;
                // discarded; fall through to fresh routing
            }
            Loaded::Active { state, raw } => {
                if let Some(flow) = spec.wizard(&state.flow) {
                    if self.wizards.check(&state, flow) {
                        // an entry command restarts its own wizard instead of
                        // feeding the text into the pending step
                        if !(spec.wizard(text).is_some() || spec.menu(text).is_some()) {
                            let flow = flow.clone();
                            return self
                                .wizard_input(ctx, bot, &flow, state, &raw, text)
                                .await;
                        }
                    } else {
                        self.wizards.delete(bot.id, user_id).await?;
                        self.executor.emit_error(ctx, "wizard", ErrorCode::StateCorrupt).await;
                    }
                } else {
                    // spec no longer has this flow; drop the orphan state
                    self.wizards.delete(bot.id, user_id).await?;
                }
            }
            Loaded::None => {}
        }

        // 3. menu flow entry (menu wins over wizard on a shared entry_cmd)
        if let Some(menu) = spec.menu(text) {
            let menu = menu.clone();
            let mut scope = Scope::new();
            let outcome = self.executor.run_actions(ctx, &menu.actions, &mut scope).await;
            return Ok(HandleResult {
                replies: outcome.replies,
                matched: true,
            });
        }

        // 4. wizard flow entry: start (or idempotently restart) the machine
        if let Some(flow) = spec.wizard(text) {
            let flow = flow.clone();
            return self.wizard_start(ctx, bot, &flow).await;
        }

        // 5. intent
        if let Some(reply_text) = spec.intents.get(text) {
            let reply = self.intent_reply(ctx, reply_text).await;
            return Ok(HandleResult::reply(reply));
        }

        // 6. silence
        Ok(HandleResult::silent())
    }

    async fn intent_reply(&self, ctx: &ActionCtx<'_>, text: &str) -> Reply {
        self.executor
            .events()
            .emit(
                Event::new(ctx.bot.id, ctx.user_id, EventType::ActionReply, ctx.trace_id)
                    .with("success", true)
                    .with("len", text.chars().count()),
            )
            .await;
        Reply::text(text)
    }

    async fn wizard_start(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        flow: &Arc<WizardFlow>,
    ) -> Result<HandleResult, RuntimeError> {
        let user_id = ctx.user_id.expect("wizard entry has a user");
        let state = WizardState::start(flow);
        self.wizards.reset(bot.id, user_id, &state).await?;
        self.executor
            .events()
            .emit(
                Event::new(bot.id, ctx.user_id, EventType::FlowStep, ctx.trace_id)
                    .with("flow", flow.entry_cmd.as_str())
                    .with("step", 0),
            )
            .await;

        let mut scope = state.vars.clone();
        let mut replies = self
            .executor
            .run_actions(ctx, &flow.on_enter, &mut scope)
            .await
            .replies;
        replies.push(self.ask_step(ctx, &flow.steps[0], user_id).await);
        Ok(HandleResult {
            replies,
            matched: true,
        })
    }

    /// Ask a step's question; widget steps carry the rendered grid.
    async fn ask_step(&self, ctx: &ActionCtx<'_>, step: &WizardStep, user_id: i64) -> Reply {
        match &step.widget {
            Some(cal) => {
                let (year, month) = widget::calendar::initial_month(cal);
                let keyboard =
                    widget::calendar::render_month(ctx.bot.id, user_id, cal, year, month);
                self.executor
                    .metrics()
                    .widget_calendar_renders_total
                    .with_label_values(&[&ctx.bot.id.to_string()])
                    .inc();
                self.executor
                    .events()
                    .emit(
                        Event::new(ctx.bot.id, ctx.user_id, EventType::WidgetRender, ctx.trace_id)
                            .with("widget", "calendar"),
                    )
                    .await;
                Reply {
                    text: step.question.clone(),
                    keyboard: Some(keyboard),
                }
            }
            None => Reply::text(step.question.clone()),
        }
    }

    async fn wizard_input(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        flow: &Arc<WizardFlow>,
        state: WizardState,
        raw: &str,
        text: &str,
    ) -> Result<HandleResult, RuntimeError> {
        let user_id = ctx.user_id.expect("wizard input has a user");
        let step = &flow.steps[state.step];

        if step.widget.is_some() {
            // widget steps advance through callbacks; re-show the grid
            return Ok(HandleResult::reply(self.ask_step(ctx, step, user_id).await));
        }

        let value = match wizard::validate_input(step.validate.as_ref(), text) {
            Ok(v) => v,
            Err(msg) => {
                self.executor
                    .emit_error(ctx, "wizard", ErrorCode::ValidationFailed)
                    .await;
                return Ok(HandleResult::reply(Reply::text(msg)));
            }
        };

        self.advance(ctx, bot, flow, state, raw, &step.var.clone(), value)
            .await
    }

    /// Store a validated value and advance the machine by one step. The CAS
    /// loser replies with the still-pending question and changes nothing.
    async fn advance(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        flow: &Arc<WizardFlow>,
        mut state: WizardState,
        raw: &str,
        var: &str,
        value: String,
    ) -> Result<HandleResult, RuntimeError> {
        let user_id = ctx.user_id.expect("wizard advance has a user");
        state.vars.insert(var.to_string(), Value::String(value));
        state.step += 1;

        if !self.wizards.save(bot.id, user_id, Some(raw), &state).await? {
            // a concurrent update won; show whatever question is now pending
            return match self.wizards.load(bot.id, user_id).await? {
                Loaded::Active { state: current, .. } if current.step < flow.steps.len() => {
                    Ok(HandleResult::reply(
                        self.ask_step(ctx, &flow.steps[current.step], user_id).await,
                    ))
                }
                _ => Ok(HandleResult::silent()),
            };
        }

        self.executor
            .events()
            .emit(
                Event::new(bot.id, ctx.user_id, EventType::FlowStep, ctx.trace_id)
                    .with("flow", flow.entry_cmd.as_str())
                    .with("step", state.step),
            )
            .await;

        let mut scope = state.vars.clone();
        if state.step >= flow.steps.len() {
            let outcome = self
                .executor
                .run_actions(ctx, &flow.on_complete, &mut scope)
                .await;
            self.wizards.delete(bot.id, user_id).await?;
            return Ok(HandleResult {
                replies: outcome.replies,
                matched: true,
            });
        }

        let mut replies = self
            .executor
            .run_actions(ctx, &flow.on_step, &mut scope)
            .await
            .replies;
        replies.push(self.ask_step(ctx, &flow.steps[state.step], user_id).await);
        Ok(HandleResult {
            replies,
            matched: true,
        })
    }

    async fn route_callback(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        spec: &Arc<CompiledSpec>,
        user_id: i64,
        data: &str,
    ) -> Result<HandleResult, RuntimeError> {
        // 2. widget callback
        if data.starts_with("cal:") {
            let Some(cb) = widget::calendar::decode(data) else {
                return Ok(HandleResult::silent());
            };
            if cb.bot_id != bot.id || cb.user_id != user_id {
                self.executor
                    .emit_error(ctx, "widget", ErrorCode::CallbackOwnerMismatch)
                    .await;
                return Ok(HandleResult::silent());
            }
            return self.widget_callback(ctx, bot, spec, user_id, cb.action).await;
        }

        // spec-declared callback matchers
        if let Some(handler) = spec.callback(data) {
            let mut scope = Scope::new();
            let outcome = self
                .executor
                .run_actions(ctx, &handler.actions, &mut scope)
                .await;
            return Ok(HandleResult {
                replies: outcome.replies,
                matched: true,
            });
        }

        Ok(HandleResult::silent())
    }

    async fn widget_callback(
        &self,
        ctx: &ActionCtx<'_>,
        bot: &BotRecord,
        spec: &Arc<CompiledSpec>,
        user_id: i64,
        action: CalAction,
    ) -> Result<HandleResult, RuntimeError> {
        // a valid pick advances the owning wizard; anything else needs the
        // wizard's widget step to still be pending
        let Loaded::Active { state, raw } = self.wizards.load(bot.id, user_id).await? else {
            return Ok(HandleResult::silent());
        };
        let Some(flow) = spec.wizard(&state.flow) else {
            return Ok(HandleResult::silent());
        };
        if !self.wizards.check(&state, flow) || state.step >= flow.steps.len() {
            return Ok(HandleResult::silent());
        }
        let flow = flow.clone();
        let step = &flow.steps[state.step];
        let Some(cal) = &step.widget else {
            return Ok(HandleResult::silent());
        };

        let in_range = |date: chrono::NaiveDate| {
            cal.min.map(|m| date >= m).unwrap_or(true) && cal.max.map(|m| date <= m).unwrap_or(true)
        };

        match action {
            CalAction::Noop => Ok(HandleResult::silent()),
            CalAction::Nav { year, month } | CalAction::Back { year, month } => {
                let keyboard = widget::calendar::render_month(bot.id, user_id, cal, year, month);
                Ok(HandleResult::reply(Reply {
                    text: step.question.clone(),
                    keyboard: Some(keyboard),
                }))
            }
            CalAction::Pick { date } => {
                if !in_range(date) {
                    return Ok(HandleResult::silent());
                }
                match cal.mode {
                    CalMode::Date => {
                        self.record_pick(ctx, "date").await;
                        let var = step.var.clone();
                        let value = CalAction::Pick { date }
                            .picked_value()
                            .expect("pick has a value");
                        self.advance(ctx, bot, &flow, state, &raw, &var, value).await
                    }
                    CalMode::DateTime => Ok(HandleResult::reply(Reply {
                        text: step.question.clone(),
                        keyboard: Some(widget::calendar::render_time_grid(bot.id, user_id, date)),
                    })),
                }
            }
            CalAction::Time { date, hour, minute } => {
                if cal.mode != CalMode::DateTime || !in_range(date) {
                    return Ok(HandleResult::silent());
                }
                self.record_pick(ctx, "datetime").await;
                let var = step.var.clone();
                let value = CalAction::Time { date, hour, minute }
                    .picked_value()
                    .expect("time pick has a value");
                self.advance(ctx, bot, &flow, state, &raw, &var, value).await
            }
        }
    }

    async fn record_pick(&self, ctx: &ActionCtx<'_>, mode: &str) {
        self.executor
            .metrics()
            .widget_calendar_picks_total
            .with_label_values(&[&ctx.bot.id.to_string(), mode])
            .inc();
        self.executor
            .events()
            .emit(
                Event::new(ctx.bot.id, ctx.user_id, EventType::WidgetPick, ctx.trace_id)
                    .with("widget", "calendar")
                    .with("mode", mode),
            )
            .await;
    }
}
