//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Record per-step cost while plans run
    pub profiling: bool,
    /// Abort executions running longer than this (0 = no limit)
    pub query_timeout_ms: u64,
    /// Number of cached plans (0 disables caching)
    pub plan_cache_size: usize,
    /// Attempts of a RETRY block before the error propagates
    pub max_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profiling: false,
            query_timeout_ms: 0,
            plan_cache_size: 256,
            max_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        if self.query_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.query_timeout_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.profiling);
        assert!(config.query_timeout().is_none());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml_str("profiling: true\nquery_timeout_ms: 250\n").unwrap();
        assert!(config.profiling);
        assert_eq!(config.query_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.plan_cache_size, 256);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            EngineConfig::from_yaml_str("max_retries: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("profiling: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
