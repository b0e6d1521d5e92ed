//! # botweave
//!
//! Multi-tenant chat-bot runtime: many independent Telegram-style bots hosted
//! in one process, each defined by a declarative JSON spec. The runtime walks
//! the spec on every inbound update and produces a reply plus optional inline
//! keyboard.
//!
//! ## Main modules
//!
//! - [`spec`]: the DSL (intents, menu flows, wizard flows, actions), the
//!   compiler to [`CompiledSpec`], and the per-bot [`SpecCache`].
//! - [`interp`]: the update router — precedence over active wizard, widget
//!   callbacks, menu entries, wizard entries, intents.
//! - [`actions`]: the action executor (`sql_query` / `sql_exec` /
//!   `reply_template` / widget emit) with tenant scoping.
//! - [`template`]: the `{{var}}` / `{{#each}}` renderer.
//! - [`sqlgate`]: the SQL gatekeeper (verb whitelist, bind rewrite, LIMIT
//!   injection, stable hashing).
//! - [`wizard`]: per-(bot, user) dialogue state with TTL and atomic advance.
//! - [`llm`]: optional reply improvement behind a per-bot circuit breaker
//!   with prompt cache, rate limit, and daily token budget.
//! - [`broadcast`]: throttled, resumable fan-out to bot audiences.
//! - [`events`] / [`metrics`]: append-only event log and Prometheus metrics.
//! - [`i18n`]: `t:key {a=b}` marker resolution with locale preference chain.
//! - [`widget`]: the stateless calendar widget.
//! - [`runtime`]: the top-level [`Runtime`] owning all process-wide state.
//!
//! Key types are re-exported at the crate root.

pub mod actions;
pub mod broadcast;
pub mod db;
pub mod error;
pub mod events;
pub mod i18n;
pub mod interp;
pub mod llm;
pub mod metrics;
pub mod outbound;
pub mod runtime;
pub mod spec;
pub mod sqlgate;
pub mod store;
pub mod template;
pub mod widget;
pub mod wizard;

pub use actions::{Action, ActionOutcome, Reply};
pub use broadcast::{Audience, BroadcastEngine, BroadcastRequest};
pub use db::{
    BotRecord, BroadcastRecord, DbError, InMemorySql, PgRunner, Repo, Row, SqlOutcome, SqlRunner,
    SqlValue,
};
pub use error::{ErrorCode, RuntimeError};
pub use events::{Event, EventSink, EventType, MemoryEventSink, PgEventSink};
pub use interp::{HandleResult, Interpreter, Update};
pub use llm::{CircuitBreaker, LlmClient, LlmService, MockLlm};
pub use metrics::Metrics;
pub use outbound::{Delivery, NullOutbound, Outbound, SendFailure};
pub use runtime::Runtime;
pub use spec::{compile, BotSpec, CompiledSpec, SpecCache, SpecProblem, SpecSource};
pub use store::{InMemoryKv, KvStore, RedisKv};
pub use template::Scope;
pub use widget::{CalendarSpec, Keyboard, KeyboardButton};
