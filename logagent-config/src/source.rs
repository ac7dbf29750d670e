//! Resolves *where* the active configuration came from, as a provenance
//! enum: callers that need to report or log the origin of the running
//! config (the `/config` admin endpoint, startup logging) match on this
//! instead of re-deriving it from CLI arguments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::env_expand;
use crate::model::Config;

pub const ENV_PATH_VAR: &str = "LOGAGENT_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// No config file was found anywhere; built-in defaults are in effect.
    #[default]
    Default,
    /// Loaded from the path named by `LOGAGENT_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// Loaded from an explicit `--config` path, or the default
    /// `configs/config.yaml` location if it happened to exist.
    File(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Default => None,
            ConfigSource::EnvPath(p) | ConfigSource::File(p) => Some(p),
        }
    }
}

/// Loads and validates the config document. Precedence: `cli_path` (the
/// `--config` flag, which always carries a value since it has a CLI
/// default) wins if the file exists; otherwise `$LOGAGENT_CONFIG_PATH`;
/// otherwise built-in defaults. A `cli_path` that differs from
/// `default_cli_path` and does not exist is a hard error (the user asked
/// for a specific file); the bundled default path is allowed to be absent
/// (fresh checkout, no config authored yet).
pub fn load(cli_path: &Path, default_cli_path: &Path) -> Result<(Config, ConfigSource)> {
    if cli_path.exists() {
        let config = read_and_parse(cli_path)?;
        return Ok((config, ConfigSource::File(cli_path.to_path_buf())));
    }
    if cli_path != default_cli_path {
        anyhow::bail!("config file not found: {}", cli_path.display());
    }

    if let Ok(env_path) = std::env::var(ENV_PATH_VAR) {
        let env_path = PathBuf::from(env_path);
        let config = read_and_parse(&env_path)?;
        return Ok((config, ConfigSource::EnvPath(env_path)));
    }

    Ok((Config::default(), ConfigSource::Default))
}

fn read_and_parse(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let expanded = env_expand::expand(&raw);
    serde_yaml::from_str(&expanded).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_default_path_falls_back_to_built_in_defaults() {
        let default_path = PathBuf::from("configs/does-not-exist.yaml");
        let (config, source) = load(&default_path, &default_path).unwrap();
        assert_eq!(source, ConfigSource::Default);
        assert_eq!(config.app.name, "logagent");
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let default_path = PathBuf::from("configs/config.yaml");
        let explicit = PathBuf::from("configs/definitely-missing.yaml");
        assert!(load(&explicit, &default_path).is_err());
    }

    #[test]
    fn existing_file_is_parsed_and_reports_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "app:\n  name: \"custom-agent\"\n").unwrap();

        let (config, source) = load(&path, &path).unwrap();
        assert_eq!(config.app.name, "custom-agent");
        assert_eq!(source, ConfigSource::File(path));
    }

    #[test]
    fn env_var_expansion_runs_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "app:\n  name: \"${AGENT_NAME:-fallback-name}\"\n").unwrap();

        let (config, _source) = load(&path, &path).unwrap();
        assert_eq!(config.app.name, "fallback-name");
    }
}
