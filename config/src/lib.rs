//! Configuration loading for the botweave runtime.
//!
//! Two layers:
//!
//! 1. [`load_and_apply`] reads `$XDG_CONFIG_HOME/botweave/config.toml` and a
//!    project `.env`, then sets process environment variables for keys that are
//!    not already set. Priority: **existing env > .env > config.toml**.
//! 2. [`Settings::from_env`] parses the resulting environment into the typed
//!    settings struct the runtime consumes.

mod env_file;
mod file_config;
mod settings;

use std::path::Path;
use thiserror::Error;

pub use settings::{LlmSettings, Settings};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("config file path: {0}")]
    ConfigPath(String),
    #[error("read config file: {0}")]
    ConfigRead(std::io::Error),
    #[error("parse config toml: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    EnvFileRead(std::io::Error),
    #[error("invalid setting {key}: {reason}")]
    BadSetting { key: &'static str, reason: String },
}

/// Applies config file and `.env` values to the process environment, skipping
/// keys that are already set (so the real environment always wins).
///
/// * `app_name`: XDG directory name, normally `"botweave"`.
/// * `override_dir`: look for `.env` here instead of the current directory.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let file_map = file_config::load_env_map(app_name)?;
    let env_map = env_file::load_env_map(override_dir).map_err(LoadError::EnvFileRead)?;

    let mut keys: std::collections::HashSet<String> = file_map.keys().cloned().collect();
    keys.extend(env_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue;
        }
        if let Some(v) = env_map.get(&key).or_else(|| file_map.get(&key)) {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins() {
        env::set_var("BOTWEAVE_TEST_EXISTING", "from_env");
        let _ = load_and_apply("botweave", None);
        assert_eq!(
            env::var("BOTWEAVE_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("BOTWEAVE_TEST_EXISTING");
    }

    #[test]
    fn no_config_anywhere_is_ok() {
        let r = load_and_apply("botweave-nonexistent-app-xyz", None::<&Path>);
        assert!(r.is_ok());
    }

    #[test]
    fn env_file_overrides_config_file() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("botweave");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nBOTWEAVE_TEST_PRIORITY = \"from_toml\"\n",
        )
        .unwrap();

        let env_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            env_dir.path().join(".env"),
            "BOTWEAVE_TEST_PRIORITY=from_env_file\n",
        )
        .unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("BOTWEAVE_TEST_PRIORITY");

        let _ = load_and_apply("botweave", Some(env_dir.path()));
        let val = env::var("BOTWEAVE_TEST_PRIORITY").unwrap();
        env::remove_var("BOTWEAVE_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert_eq!(val, "from_env_file");
    }

    #[test]
    fn env_file_only_when_no_config_file() {
        let env_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            env_dir.path().join(".env"),
            "BOTWEAVE_TEST_ENV_ONLY=just_env\n",
        )
        .unwrap();

        env::remove_var("BOTWEAVE_TEST_ENV_ONLY");
        let _ = load_and_apply("botweave-nonexistent-app-xyz", Some(env_dir.path()));
        let val = env::var("BOTWEAVE_TEST_ENV_ONLY").unwrap();
        env::remove_var("BOTWEAVE_TEST_ENV_ONLY");

        assert_eq!(val, "just_env");
    }
}
