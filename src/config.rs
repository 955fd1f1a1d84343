//! Tool configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RULEGATE_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Evaluation defaults.
    pub engine: EngineConfig,
    /// Definition bundles loaded at startup.
    pub definitions: DefinitionsConfig,
}

impl Config {
    /// Loads configuration from `path` (or RULEGATE_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let from_env = std::env::var("RULEGATE_CONFIG").ok().map(PathBuf::from);
        if let Some(path) = path.map(Path::to_path_buf).or(from_env) {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.logging.apply_env_overrides();
        self.engine.apply_env_overrides();
        self.definitions.apply_env_overrides();
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RULEGATE_LOG") {
            if !level.is_empty() {
                self.level = level;
            }
        }
    }
}

/// Evaluation defaults applied by the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Skip remaining rules after a deny.
    pub stop_on_first_deny: bool,
    /// Force history tracking on every loaded machine.
    pub track_history: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_on_first_deny: true,
            track_history: false,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(stop) = std::env::var("RULEGATE_STOP_ON_FIRST_DENY") {
            self.stop_on_first_deny = parse_bool(&stop);
        }
        if let Ok(track) = std::env::var("RULEGATE_TRACK_HISTORY") {
            self.track_history = parse_bool(&track);
        }
    }
}

/// Definition bundle locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionsConfig {
    pub paths: Vec<PathBuf>,
}

impl DefinitionsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(paths) = std::env::var("RULEGATE_DEFINITIONS") {
            self.paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "warn");
        assert!(config.engine.stop_on_first_deny);
        assert!(!config.engine.track_history);
        assert!(config.definitions.paths.is_empty());
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engine:\n  track_history: true\ndefinitions:\n  paths:\n    - rules/orders.yaml"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.engine.track_history);
        // Unspecified keys keep their defaults.
        assert!(config.engine.stop_on_first_deny);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.definitions.paths, vec![PathBuf::from("rules/orders.yaml")]);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("absent.yaml"));
    }

    #[test]
    fn test_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine: [not, a, map").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.engine.track_history = true;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed.engine.track_history);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("no"));
    }
}
