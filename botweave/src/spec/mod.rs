//! Bot specs: the declarative DSL, its compiled form, and the per-bot cache.
//!
//! A spec is a versioned JSON document. On load it is compiled into an
//! indexed form (entry-command maps, intent map, callback matchers) that the
//! interpreter walks; the raw document is never consulted at runtime.

mod cache;
mod compile;
mod dsl;

pub use cache::{SpecCache, SpecSource};
pub use compile::{
    compile, CallbackHandler, CompiledSpec, MenuFlow, SpecProblem, StepValidate, WizardFlow,
    WizardStep, DEFAULT_TTL, MAX_WIZARD_STEPS, MIN_TTL,
};
pub use dsl::{BotSpec, CalendarParams, KeyboardButtonSpec, KeyboardSpec, RawFlow, RawStep};
