//! Typed runtime settings parsed from the process environment.
//!
//! Call [`crate::load_and_apply`] first so `.env` / `config.toml` values are
//! visible, then [`Settings::from_env`].

use std::time::Duration;

use crate::LoadError;

/// LLM-related settings (`LLM_*` variables).
#[derive(Clone, Debug)]
pub struct LlmSettings {
    /// Master switch; when false the improvement step is skipped everywhere.
    pub enabled: bool,
    /// Base URL of the OpenAI-compatible upstream.
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Requests per minute per (bot, user).
    pub rate_limit: u32,
    /// Prompt-cache TTL.
    pub cache_ttl: Duration,
}

/// Everything the runtime reads from the environment, parsed once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub llm: LlmSettings,
    /// Default for the tracing `EnvFilter` when `RUST_LOG` is unset.
    pub log_level: String,
    /// Horizon for the bot_events retention sweeper; `None` disables it.
    pub events_retention_days: Option<u32>,
    pub metrics_enabled: bool,
    /// When true, event payloads mask sensitive values.
    pub mask_sensitive_data: bool,
    /// HTTP listen address for the serve binary.
    pub listen_addr: String,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, LoadError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(LoadError::BadSetting {
                key,
                reason: format!("expected boolean, got {other:?}"),
            }),
        },
    }
}

fn parse_u32(key: &'static str, default: u32) -> Result<u32, LoadError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => v.parse().map_err(|_| LoadError::BadSetting {
            key,
            reason: format!("expected integer, got {v:?}"),
        }),
    }
}

impl Settings {
    /// Parse all settings from the environment. Unset keys take documented
    /// defaults; malformed values are an error rather than a silent default.
    pub fn from_env() -> Result<Self, LoadError> {
        let llm = LlmSettings {
            enabled: parse_bool("LLM_ENABLED", false)?,
            base_url: var_or("LLM_BASE_URL", "http://127.0.0.1:11434/v1"),
            model: var_or("LLM_MODEL", "gpt-4o-mini"),
            timeout: Duration::from_secs(parse_u32("LLM_TIMEOUT", 30)? as u64),
            max_retries: parse_u32("LLM_MAX_RETRIES", 2)?,
            rate_limit: parse_u32("LLM_RATE_LIMIT", 10)?,
            cache_ttl: Duration::from_secs(parse_u32("LLM_CACHE_TTL", 900)? as u64),
        };
        let retention = parse_u32("EVENTS_DB_RETENTION_DAYS", 0)?;
        Ok(Settings {
            database_url: var_or("DATABASE_URL", "postgres://localhost/botweave"),
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            llm,
            log_level: var_or("LOG_LEVEL", "info"),
            events_retention_days: (retention > 0).then_some(retention),
            metrics_enabled: parse_bool("METRICS_ENABLED", true)?,
            mask_sensitive_data: parse_bool("MASK_SENSITIVE_DATA", true)?,
            listen_addr: var_or("LISTEN_ADDR", "127.0.0.1:8000"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = env_guard();
        for k in [
            "LLM_ENABLED",
            "LLM_TIMEOUT",
            "EVENTS_DB_RETENTION_DAYS",
            "METRICS_ENABLED",
            "MASK_SENSITIVE_DATA",
        ] {
            std::env::remove_var(k);
        }
        let s = Settings::from_env().unwrap();
        assert!(!s.llm.enabled);
        assert_eq!(s.llm.timeout, Duration::from_secs(30));
        assert_eq!(s.llm.rate_limit, 10);
        assert_eq!(s.llm.cache_ttl, Duration::from_secs(900));
        assert!(s.events_retention_days.is_none());
        assert!(s.metrics_enabled);
        assert!(s.mask_sensitive_data);
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let _guard = env_guard();
        std::env::set_var("METRICS_ENABLED", "maybe");
        let r = Settings::from_env();
        std::env::remove_var("METRICS_ENABLED");
        assert!(matches!(r, Err(LoadError::BadSetting { key, .. }) if key == "METRICS_ENABLED"));
    }

    #[test]
    fn retention_zero_disables() {
        let _guard = env_guard();
        std::env::set_var("EVENTS_DB_RETENTION_DAYS", "0");
        let s = Settings::from_env().unwrap();
        std::env::remove_var("EVENTS_DB_RETENTION_DAYS");
        assert!(s.events_retention_days.is_none());
    }

    #[test]
    fn retention_positive_enables() {
        let _guard = env_guard();
        std::env::set_var("EVENTS_DB_RETENTION_DAYS", "14");
        let s = Settings::from_env().unwrap();
        std::env::remove_var("EVENTS_DB_RETENTION_DAYS");
        assert_eq!(s.events_retention_days, Some(14));
    }
}
