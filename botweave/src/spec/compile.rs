//! Spec compiler: raw DSL → indexed, regex-precompiled form.
//!
//! Compilation is strict: any problem fails the document and nothing is
//! cached, so the runtime only ever executes specs that compiled cleanly.
//! The validate operation surfaces the same problem list without publishing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use super::dsl::{BotSpec, CalendarParams, RawFlow, RawStep};
use crate::actions::Action;
use crate::widget::{CalMode, CalendarSpec};

pub const MAX_WIZARD_STEPS: usize = 10;
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);
pub const MIN_TTL: Duration = Duration::from_secs(60);

/// A problem found while compiling. `Display` output is what the validate
/// operation returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpecProblem {
    BadShape(String),
    MissingEntryCmd { index: usize },
    UnknownFlowType { entry_cmd: String, flow_type: String },
    DuplicateEntry { entry_cmd: String },
    UnknownAction { location: String, detail: String },
    BadRegex { var: String, detail: String },
    BadWidget { var: String, detail: String },
    MissingQuestion { var: String },
    EmptyWizard { entry_cmd: String },
    TooManySteps { entry_cmd: String, count: usize },
}

impl std::fmt::Display for SpecProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl SpecProblem {
    pub fn describe(&self) -> String {
        match self {
            SpecProblem::BadShape(d) => format!("spec does not match the DSL shape: {d}"),
            SpecProblem::MissingEntryCmd { index } => {
                format!("flow #{index} has no entry_cmd")
            }
            SpecProblem::UnknownFlowType { entry_cmd, flow_type } => {
                format!("flow {entry_cmd}: unknown type {flow_type}")
            }
            SpecProblem::DuplicateEntry { entry_cmd } => {
                format!("duplicate entry command {entry_cmd}")
            }
            SpecProblem::UnknownAction { location, detail } => {
                format!("{location}: unknown or malformed action: {detail}")
            }
            SpecProblem::BadRegex { var, detail } => {
                format!("step {var}: invalid validation regex: {detail}")
            }
            SpecProblem::BadWidget { var, detail } => {
                format!("step {var}: invalid widget: {detail}")
            }
            SpecProblem::MissingQuestion { var } => {
                format!("step {var}: question is required without a widget")
            }
            SpecProblem::EmptyWizard { entry_cmd } => {
                format!("wizard {entry_cmd} has no steps")
            }
            SpecProblem::TooManySteps { entry_cmd, count } => {
                format!("wizard {entry_cmd} has {count} steps (max {MAX_WIZARD_STEPS})")
            }
        }
    }
}

#[derive(Debug)]
pub struct MenuFlow {
    pub entry_cmd: String,
    pub name: Option<String>,
    pub actions: Vec<Action>,
}

#[derive(Debug)]
pub struct WizardFlow {
    pub entry_cmd: String,
    pub steps: Vec<WizardStep>,
    pub on_enter: Vec<Action>,
    pub on_step: Vec<Action>,
    pub on_complete: Vec<Action>,
    pub ttl: Duration,
}

#[derive(Debug)]
pub struct WizardStep {
    pub var: String,
    pub question: String,
    pub validate: Option<StepValidate>,
    pub widget: Option<CalendarSpec>,
}

#[derive(Debug)]
pub struct StepValidate {
    pub regex: Regex,
    pub msg: String,
}

#[derive(Debug)]
pub struct CallbackHandler {
    pub data: String,
    pub actions: Vec<Action>,
}

/// Compiled, immutable spec. Held behind an `Arc` in the cache; handlers keep
/// their reference across a reload.
#[derive(Debug)]
pub struct CompiledSpec {
    pub version: i64,
    pub use_tags: Vec<String>,
    pub intents: HashMap<String, String>,
    pub menus: HashMap<String, Arc<MenuFlow>>,
    pub wizards: HashMap<String, Arc<WizardFlow>>,
    pub callbacks: Vec<CallbackHandler>,
}

impl CompiledSpec {
    /// Menu-first entry lookup (menu wins when both declare the command).
    pub fn menu(&self, cmd: &str) -> Option<&Arc<MenuFlow>> {
        self.menus.get(cmd)
    }

    pub fn wizard(&self, cmd: &str) -> Option<&Arc<WizardFlow>> {
        self.wizards.get(cmd)
    }

    pub fn callback(&self, data: &str) -> Option<&CallbackHandler> {
        self.callbacks.iter().find(|c| c.data == data)
    }
}

fn compile_actions(list: &[Value], location: &str, problems: &mut Vec<SpecProblem>) -> Vec<Action> {
    let mut out = Vec::with_capacity(list.len());
    for v in list {
        match serde_json::from_value::<Action>(v.clone()) {
            Ok(a) => out.push(a),
            Err(e) => problems.push(SpecProblem::UnknownAction {
                location: location.to_string(),
                detail: e.to_string(),
            }),
        }
    }
    out
}

fn compile_widget(params: &CalendarParams, var: &str, problems: &mut Vec<SpecProblem>) -> Option<CalendarSpec> {
    let mode = match params.mode.as_str() {
        "date" => CalMode::Date,
        "datetime" => CalMode::DateTime,
        other => {
            problems.push(SpecProblem::BadWidget {
                var: var.to_string(),
                detail: format!("unknown mode {other}"),
            });
            return None;
        }
    };
    let parse_date = |s: &Option<String>, which: &str, problems: &mut Vec<SpecProblem>| {
        s.as_ref().and_then(|raw| {
            match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                Ok(d) => Some(d),
                Err(_) => {
                    problems.push(SpecProblem::BadWidget {
                        var: var.to_string(),
                        detail: format!("{which} is not a date: {raw}"),
                    });
                    None
                }
            }
        })
    };
    let min = parse_date(&params.min, "min", problems);
    let max = parse_date(&params.max, "max", problems);
    Some(CalendarSpec {
        mode,
        min,
        max,
        tz: params.tz.clone(),
        title: params.title.clone(),
    })
}

fn compile_step(raw: &RawStep, problems: &mut Vec<SpecProblem>) -> WizardStep {
    let widget = raw
        .widget
        .as_ref()
        .and_then(|w| compile_widget(w, &raw.var, problems));
    let question = match (&raw.question, &widget) {
        (Some(q), _) => q.clone(),
        (None, Some(w)) => w
            .title
            .clone()
            .unwrap_or_else(|| "Выберите дату:".to_string()),
        (None, None) => {
            problems.push(SpecProblem::MissingQuestion {
                var: raw.var.clone(),
            });
            String::new()
        }
    };
    let validate = raw.validate.as_ref().and_then(|v| {
        match Regex::new(&v.regex) {
            Ok(regex) => Some(StepValidate {
                regex,
                msg: v.msg.clone(),
            }),
            Err(e) => {
                problems.push(SpecProblem::BadRegex {
                    var: raw.var.clone(),
                    detail: e.to_string(),
                });
                None
            }
        }
    });
    WizardStep {
        var: raw.var.clone(),
        question,
        validate,
        widget,
    }
}

enum FlowKind {
    Menu,
    Wizard,
}

fn flow_kind(flow: &RawFlow, forced: Option<FlowKind>) -> Result<FlowKind, Option<String>> {
    if let Some(kind) = forced {
        return Ok(kind);
    }
    match flow.flow_type.as_deref() {
        Some("flow.menu.v1") => Ok(FlowKind::Menu),
        Some("flow.wizard.v1") => Ok(FlowKind::Wizard),
        Some(other) => Err(Some(other.to_string())),
        // untyped entries in the unified array: wizard when steps are present
        None if !flow.steps.is_empty() || flow.params.is_some() => Ok(FlowKind::Wizard),
        None => Err(None),
    }
}

fn compile_wizard(flow: &RawFlow, entry_cmd: &str, problems: &mut Vec<SpecProblem>) -> WizardFlow {
    // v1 nests everything under params; legacy keeps it at the top level.
    // Both compile to the same form.
    let (steps, on_enter, on_step, on_complete, ttl_sec) = match &flow.params {
        Some(p) => (&p.steps, &p.on_enter, &p.on_step, &p.on_complete, p.ttl_sec),
        None => (
            &flow.steps,
            &flow.on_enter,
            &flow.on_step,
            &flow.on_complete,
            flow.ttl_sec,
        ),
    };
    if steps.is_empty() {
        problems.push(SpecProblem::EmptyWizard {
            entry_cmd: entry_cmd.to_string(),
        });
    } else if steps.len() > MAX_WIZARD_STEPS {
        problems.push(SpecProblem::TooManySteps {
            entry_cmd: entry_cmd.to_string(),
            count: steps.len(),
        });
    }
    let ttl = ttl_sec
        .map(|s| Duration::from_secs(s).max(MIN_TTL))
        .unwrap_or(DEFAULT_TTL);
    WizardFlow {
        entry_cmd: entry_cmd.to_string(),
        steps: steps.iter().map(|s| compile_step(s, problems)).collect(),
        on_enter: compile_actions(on_enter, &format!("{entry_cmd}.on_enter"), problems),
        on_step: compile_actions(on_step, &format!("{entry_cmd}.on_step"), problems),
        on_complete: compile_actions(on_complete, &format!("{entry_cmd}.on_complete"), problems),
        ttl,
    }
}

/// Compile a spec document. Deterministic: the same document and version
/// always produce the same compiled form.
pub fn compile(doc: &Value, version: i64) -> Result<CompiledSpec, Vec<SpecProblem>> {
    let spec: BotSpec = match serde_json::from_value(doc.clone()) {
        Ok(s) => s,
        Err(e) => return Err(vec![SpecProblem::BadShape(e.to_string())]),
    };
    let mut problems = Vec::new();

    let mut intents = HashMap::new();
    for intent in &spec.intents {
        if intents
            .insert(intent.cmd.clone(), intent.reply.clone())
            .is_some()
        {
            problems.push(SpecProblem::DuplicateEntry {
                entry_cmd: intent.cmd.clone(),
            });
        }
    }

    let mut menus: HashMap<String, Arc<MenuFlow>> = HashMap::new();
    let mut wizards: HashMap<String, Arc<WizardFlow>> = HashMap::new();

    let all_flows = spec
        .flows
        .iter()
        .map(|f| (f, None))
        .chain(spec.menu_flows.iter().map(|f| (f, Some(FlowKind::Menu))))
        .chain(spec.wizard_flows.iter().map(|f| (f, Some(FlowKind::Wizard))));

    for (index, (flow, forced)) in all_flows.enumerate() {
        let Some(entry_cmd) = flow.entry_cmd.clone() else {
            problems.push(SpecProblem::MissingEntryCmd { index });
            continue;
        };
        match flow_kind(flow, forced) {
            Ok(FlowKind::Menu) => {
                let compiled = MenuFlow {
                    entry_cmd: entry_cmd.clone(),
                    name: flow.name.clone(),
                    actions: compile_actions(&flow.actions, &entry_cmd, &mut problems),
                };
                if menus.insert(entry_cmd.clone(), Arc::new(compiled)).is_some() {
                    problems.push(SpecProblem::DuplicateEntry { entry_cmd });
                }
            }
            Ok(FlowKind::Wizard) => {
                let compiled = compile_wizard(flow, &entry_cmd, &mut problems);
                if wizards.insert(entry_cmd.clone(), Arc::new(compiled)).is_some() {
                    problems.push(SpecProblem::DuplicateEntry { entry_cmd });
                }
            }
            Err(unknown) => {
                problems.push(SpecProblem::UnknownFlowType {
                    entry_cmd,
                    flow_type: unknown.unwrap_or_else(|| "(none)".to_string()),
                });
            }
        }
    }

    let callbacks = spec
        .callbacks
        .iter()
        .map(|c| CallbackHandler {
            data: c.data.clone(),
            actions: compile_actions(&c.actions, &format!("callback {}", c.data), &mut problems),
        })
        .collect();

    if !problems.is_empty() {
        return Err(problems);
    }
    Ok(CompiledSpec {
        version,
        use_tags: spec.use_tags,
        intents,
        menus,
        wizards,
        callbacks,
    })
}
