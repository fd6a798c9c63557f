use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{sanitize_config, Config};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const CLIENT_ID_ENV: &str = "TUNEBAR_CLIENT_ID";

/// `<config_dir>/tunebar`, created on demand by [`load_or_create_config`].
pub fn config_root() -> Option<PathBuf> {
    dirs::config_dir().map(|path| path.join("tunebar"))
}

pub fn system_config_template_text() -> &'static str {
    include_str!("../config/config.system.toml")
}

/// Reads the config at `path`, writing the commented system template first
/// when the file does not exist yet. Unparseable files fall back to
/// defaults without being overwritten.
pub fn load_or_create_config(path: &Path) -> Result<Config, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            format!(
                "failed to create config directory {}: {}",
                parent.display(),
                err
            )
        })?;
    }

    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        std::fs::write(path, system_config_template_text()).map_err(|err| {
            format!(
                "failed to write default config file {}: {}",
                path.display(),
                err
            )
        })?;
    }

    let config_content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config file {}: {}", path.display(), err))?;
    let config = match toml::from_str::<Config>(&config_content) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    };
    Ok(sanitize_config(config))
}

/// Applies environment overrides on top of the file-backed config.
pub fn apply_environment_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(client_id) = lookup(CLIENT_ID_ENV) {
        let client_id = client_id.trim();
        if !client_id.is_empty() {
            config.auth.client_id = client_id.to_string();
        }
    }
    config
}

pub fn persist_config_file(config: &Config, path: &Path) -> Result<(), String> {
    let config_text = toml::to_string(config)
        .map_err(|err| format!("failed to serialize config for {}: {}", path.display(), err))?;
    std::fs::write(path, config_text)
        .map_err(|err| format!("failed to persist config to {}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::{
        apply_environment_overrides, load_or_create_config, persist_config_file,
        system_config_template_text, CLIENT_ID_ENV,
    };
    use crate::config::{Config, UiPosition};

    #[test]
    fn test_missing_config_is_created_from_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_create_config(&path).expect("load config");

        assert_eq!(config, Config::default());
        let written = std::fs::read_to_string(&path).expect("config written");
        assert_eq!(written, system_config_template_text());
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults_without_overwriting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ui\nopacity = ").expect("seed config");

        let config = load_or_create_config(&path).expect("load config");

        assert_eq!(config, Config::default());
        assert_eq!(
            std::fs::read_to_string(&path).expect("read back"),
            "[ui\nopacity = "
        );
    }

    #[test]
    fn test_loaded_config_is_sanitized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ui]\nopacity = 4.0\nposition = \"top_start\"\n")
            .expect("seed config");

        let config = load_or_create_config(&path).expect("load config");

        assert!((config.ui.opacity - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.ui.position, UiPosition::TopStart);
    }

    #[test]
    fn test_persisted_config_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.auth.client_id = "client-123".to_string();
        config.sync.poll_interval_ms = 2_000;

        persist_config_file(&config, &path).expect("persist");

        assert_eq!(load_or_create_config(&path).expect("reload"), config);
    }

    #[test]
    fn test_client_id_env_override_ignores_blank_values() {
        let mut config = Config::default();
        config.auth.client_id = "from-file".to_string();

        let blank = apply_environment_overrides(config.clone(), |_| Some("  ".to_string()));
        assert_eq!(blank.auth.client_id, "from-file");

        let overridden = apply_environment_overrides(config, |key| {
            (key == CLIENT_ID_ENV).then(|| "from-env".to_string())
        });
        assert_eq!(overridden.auth.client_id, "from-env");
    }
}
