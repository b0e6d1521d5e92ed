//! Raw DSL shapes as authors write them.
//!
//! Deserialization here is permissive: actions stay as JSON values (the
//! compiler turns them into [`crate::actions::Action`] so it can report
//! problems instead of failing the whole document), and wizard flows are
//! accepted in both encodings — legacy with top-level `steps`/`on_complete`,
//! and v1 with everything nested under `params`.

use serde::Deserialize;
use serde_json::Value;

/// Top-level spec document. The three handler forms are accepted either in
/// the unified `flows` array or in the segregated arrays.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BotSpec {
    #[serde(default, rename = "use")]
    pub use_tags: Vec<String>,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub flows: Vec<RawFlow>,
    #[serde(default)]
    pub menu_flows: Vec<RawFlow>,
    #[serde(default)]
    pub wizard_flows: Vec<RawFlow>,
    #[serde(default)]
    pub callbacks: Vec<RawCallback>,
}

/// Trivial `cmd → reply` pair.
#[derive(Clone, Debug, Deserialize)]
pub struct Intent {
    pub cmd: String,
    pub reply: String,
}

/// A flow before compilation. `type` discriminates in the unified array; in
/// the segregated arrays it may be omitted.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawFlow {
    #[serde(default, rename = "type")]
    pub flow_type: Option<String>,
    pub entry_cmd: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Menu flows: ordered action list.
    #[serde(default)]
    pub actions: Vec<Value>,
    /// Legacy wizard encoding: steps and hooks at the top level.
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub on_enter: Vec<Value>,
    #[serde(default)]
    pub on_step: Vec<Value>,
    #[serde(default)]
    pub on_complete: Vec<Value>,
    #[serde(default)]
    pub ttl_sec: Option<u64>,
    /// v1 wizard encoding: the same fields nested under `params`.
    #[serde(default)]
    pub params: Option<WizardParams>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WizardParams {
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub on_enter: Vec<Value>,
    #[serde(default)]
    pub on_step: Vec<Value>,
    #[serde(default)]
    pub on_complete: Vec<Value>,
    #[serde(default)]
    pub ttl_sec: Option<u64>,
}

/// One wizard step: either a question with regex validation, or a widget
/// whose terminal pick fills `var`.
#[derive(Clone, Debug, Deserialize)]
pub struct RawStep {
    pub var: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub validate: Option<RawValidate>,
    #[serde(default)]
    pub widget: Option<CalendarParams>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawValidate {
    pub regex: String,
    pub msg: String,
}

/// Calendar widget parameters as written in the spec.
#[derive(Clone, Debug, Deserialize)]
pub struct CalendarParams {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

fn default_mode() -> String {
    "date".to_string()
}

/// Exact-match callback handler.
#[derive(Clone, Debug, Deserialize)]
pub struct RawCallback {
    pub data: String,
    #[serde(default)]
    pub actions: Vec<Value>,
}

/// Inline keyboard literal in a `reply_template` action: rows of buttons.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyboardSpec(pub Vec<Vec<KeyboardButtonSpec>>);

#[derive(Clone, Debug, Deserialize)]
pub struct KeyboardButtonSpec {
    pub text: String,
    #[serde(default)]
    pub callback_data: Option<String>,
}

impl KeyboardSpec {
    /// Buttons without explicit callback data echo their label.
    pub fn to_keyboard(&self) -> crate::widget::Keyboard {
        crate::widget::Keyboard {
            rows: self
                .0
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| crate::widget::KeyboardButton {
                            text: b.text.clone(),
                            callback_data: b
                                .callback_data
                                .clone()
                                .unwrap_or_else(|| b.text.clone()),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}
