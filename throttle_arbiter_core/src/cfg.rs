use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::level::{ParseLevelError, PriorityLevel};

/// Environment variable overriding `enforced_level`.
pub const ENV_ENFORCED_LEVEL: &str = "THROTTLE_ENFORCED_LEVEL";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCfg {
    /// Manual override applied at construction. `unknown` keeps auto mode.
    #[serde(default)]
    pub enforced_level: PriorityLevel,
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {source}")]
    InvalidEnv {
        var: &'static str,
        #[source]
        source: ParseLevelError,
    },
}

impl ThrottleCfg {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or an
    /// override holds an unknown level name.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_toml_str(&text)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var(ENV_ENFORCED_LEVEL) {
            if !v.trim().is_empty() {
                self.enforced_level = v.parse().map_err(|source| ConfigError::InvalidEnv {
                    var: ENV_ENFORCED_LEVEL,
                    source,
                })?;
            }
        }
        Ok(())
    }
}
