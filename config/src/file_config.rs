//! Load the `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        dirs::config_dir()
            .ok_or_else(|| LoadError::ConfigPath("no config directory for this platform".into()))?
    };
    let path = base.join(app_name).join("config.toml");
    Ok(path.exists().then_some(path))
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns the `[env]` key-value pairs. Missing file or missing section is an
/// empty map; unparseable TOML is an error.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = config_path(app_name)? else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::ConfigRead)?;
    let parsed: ConfigFile = toml::from_str(&content)?;
    Ok(parsed.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn with_xdg<R>(dir: &std::path::Path, f: impl FnOnce() -> R) -> R {
        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir);
        let out = f();
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
        out
    }

    #[test]
    fn missing_file_is_empty() {
        let map = load_env_map("botweave-test-nonexistent-12345").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn reads_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("testapp");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nREDIS_URL = \"redis://localhost\"\n",
        )
        .unwrap();

        let map = with_xdg(dir.path(), || load_env_map("testapp")).unwrap();
        assert_eq!(map.get("REDIS_URL"), Some(&"redis://localhost".to_string()));
    }

    #[test]
    fn no_env_section_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("noenv");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "[other]\nkey = \"x\"\n").unwrap();

        let map = with_xdg(dir.path(), || load_env_map("noenv")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("badapp");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "broken [[[\n").unwrap();

        let result = with_xdg(dir.path(), || load_env_map("badapp"));
        assert!(matches!(result, Err(LoadError::ConfigParse(_))));
    }
}
