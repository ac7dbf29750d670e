//! CLI surface, parsed with `clap`'s derive API
//! (`#[derive(Parser)]`, with an `env` fallback on the one flag that
//! doubles as an environment variable).

use std::path::PathBuf;

use clap::Parser;

pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

#[derive(Debug, Parser)]
#[command(name = "logagent", version, about = "Log aggregation agent")]
pub struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long, env = "LOGAGENT_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Parse and validate the configuration, then exit without starting
    /// the agent (exit code 0 on success, 1 on validation failure).
    #[arg(long)]
    pub validate_config: bool,
}

impl Cli {
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_flag() {
        let cli = Cli::parse_from(["logagent", "--config", "custom.yaml"]);
        assert_eq!(cli.config, PathBuf::from("custom.yaml"));
        assert!(!cli.validate_config);
    }

    #[test]
    fn defaults_to_bundled_config_path() {
        let cli = Cli::parse_from(["logagent"]);
        assert_eq!(cli.config, Cli::default_config_path());
    }

    #[test]
    fn parses_validate_config_flag() {
        let cli = Cli::parse_from(["logagent", "--validate-config"]);
        assert!(cli.validate_config);
    }
}
