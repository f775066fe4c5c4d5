//! Configuration file discovery and validated loading.

use std::path::{Path, PathBuf};

use super::Config;

/// File name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = "hidden-player.toml";

/// Finds, parses and validates the configuration file.
///
/// Lookup order: `./hidden-player.toml`, then
/// `<config_dir>/hidden-player/config.toml`. An explicit path replaces both.
#[derive(Debug)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("hidden-player").join("config.toml"));
        }
        Self { candidates }
    }

    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            candidates: vec![path],
        }
    }

    /// Load the first existing candidate, or defaults when none exists.
    ///
    /// The result is validated, so components receive options they can use
    /// as-is.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ReadError`] / [`ConfigError::ParseError`] for an
    ///   unreadable or malformed file
    /// - [`ConfigError::Invalid`] when a value is out of range
    pub fn load(&self) -> Result<Config, ConfigError> {
        let config = match self.find_config_file() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::parse_file(&path)?
            }
            None => {
                tracing::debug!(candidates = ?self.candidates, "No config file found, using defaults");
                Config::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.candidates
    }

    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|p| p.is_file()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Check every section for values the components cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.presence.validate()?;
        if self.watchdog.enabled && self.watchdog.threshold == 0 {
            return Err(ConfigError::Invalid(
                "watchdog threshold must be at least 1".to_string(),
            ));
        }
        if self.watchdog.enabled && self.watchdog.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog interval must not be 0".to_string(),
            ));
        }
        if self.supervisor.terminate_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor terminate timeout must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
