//! Wizard state: the per-(bot, user) record behind multi-step dialogues.
//!
//! The authoritative copy lives in the shared [`KvStore`] under
//! `state:{bot_id}:{user_id}`; concurrent receives for the same key race
//! through compare-and-swap and exactly one advances the step. Corrupt
//! records (bad JSON, unknown format tag, missing fields) are discarded and
//! treated as "no state".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::spec::{StepValidate, WizardFlow};
use crate::store::{KvError, KvStore};
use crate::template::Scope;

/// Format tag for records this version can read.
pub const FORMAT: &str = "wizard.v1";

/// Inputs longer than this are truncated before validation.
pub const MAX_INPUT_LEN: usize = 1_024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WizardState {
    pub format: String,
    /// Entry command of the owning flow; routing re-reads the spec by it.
    pub flow: String,
    pub step: usize,
    pub vars: Scope,
    pub started_at: i64,
    pub ttl_sec: u64,
}

impl WizardState {
    /// Fresh state for step 0 of `flow`.
    pub fn start(flow: &WizardFlow) -> Self {
        WizardState {
            format: FORMAT.to_string(),
            flow: flow.entry_cmd.clone(),
            step: 0,
            vars: Scope::new(),
            started_at: chrono::Utc::now().timestamp(),
            ttl_sec: flow.ttl.as_secs(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_sec.max(60))
    }

    fn valid_for(&self, flow: &WizardFlow) -> bool {
        self.format == FORMAT && self.step <= flow.steps.len()
    }
}

/// Truncate then validate one step input. `Ok` carries the value to store.
pub fn validate_input<'a>(
    validate: Option<&'a StepValidate>,
    input: &str,
) -> Result<String, &'a str> {
    let truncated: String = input.chars().take(MAX_INPUT_LEN).collect();
    match validate {
        None => Ok(truncated),
        Some(v) if v.regex.is_match(&truncated) => Ok(truncated),
        Some(v) => Err(v.msg.as_str()),
    }
}

/// What a load found.
pub enum Loaded {
    None,
    /// Record existed but was unreadable; it has been deleted.
    Corrupt,
    /// Active state plus the raw string it was read from (the CAS witness).
    Active { state: WizardState, raw: String },
}

/// Store facade over the shared KV.
#[derive(Clone)]
pub struct WizardStore {
    kv: Arc<dyn KvStore>,
}

fn key(bot_id: Uuid, user_id: i64) -> String {
    format!("state:{bot_id}:{user_id}")
}

fn map_kv(e: KvError) -> RuntimeError {
    match e {
        KvError::Unavailable(m) => RuntimeError::DbUnavailable(m),
        KvError::Other(m) => RuntimeError::Internal(m),
    }
}

impl WizardStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn load(&self, bot_id: Uuid, user_id: i64) -> Result<Loaded, RuntimeError> {
        let raw = match self.kv.get(&key(bot_id, user_id)).await.map_err(map_kv)? {
            Some(raw) => raw,
            None => return Ok(Loaded::None),
        };
        match serde_json::from_str::<WizardState>(&raw) {
            Ok(state) if state.format == FORMAT => Ok(Loaded::Active { state, raw }),
            _ => {
                self.kv.delete(&key(bot_id, user_id)).await.map_err(map_kv)?;
                Ok(Loaded::Corrupt)
            }
        }
    }

    /// Validate a loaded state against its flow; step out of range counts as
    /// corrupt (the spec may have shrunk since the record was written).
    pub fn check(&self, state: &WizardState, flow: &WizardFlow) -> bool {
        state.valid_for(flow)
    }

    /// CAS save: `witness` is the raw value the caller loaded (`None` for a
    /// fresh start). Returns false when a concurrent update won.
    pub async fn save(
        &self,
        bot_id: Uuid,
        user_id: i64,
        witness: Option<&str>,
        state: &WizardState,
    ) -> Result<bool, RuntimeError> {
        let serialized =
            serde_json::to_string(state).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.kv
            .compare_and_swap(&key(bot_id, user_id), witness, &serialized, Some(state.ttl()))
            .await
            .map_err(map_kv)
    }

    /// Unconditional overwrite; entry-command restarts reset whatever is
    /// there.
    pub async fn reset(
        &self,
        bot_id: Uuid,
        user_id: i64,
        state: &WizardState,
    ) -> Result<(), RuntimeError> {
        let serialized =
            serde_json::to_string(state).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.kv
            .set(&key(bot_id, user_id), &serialized, Some(state.ttl()))
            .await
            .map_err(map_kv)
    }

    pub async fn delete(&self, bot_id: Uuid, user_id: i64) -> Result<(), RuntimeError> {
        self.kv.delete(&key(bot_id, user_id)).await.map_err(map_kv)
    }
}
