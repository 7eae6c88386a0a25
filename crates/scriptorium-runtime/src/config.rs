//! Runtime configuration.
//!
//! Loaded from YAML or JSON, then optionally overridden from the
//! environment:
//!
//! | variable | field |
//! |---|---|
//! | `SCRIPTORIUM_MODE` | `mode` (`quick` / `deep`) |
//! | `SCRIPTORIUM_MAX_WORKERS` | `max_workers` |
//! | `SCRIPTORIUM_MAX_TIME` | `budget.max_time` (humantime, e.g. `10m`) |

use scriptorium_core::{Budget, ExecutionMode, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::resilience::CircuitBreakerConfig;

pub const ENV_MODE: &str = "SCRIPTORIUM_MODE";
pub const ENV_MAX_WORKERS: &str = "SCRIPTORIUM_MAX_WORKERS";
pub const ENV_MAX_TIME: &str = "SCRIPTORIUM_MAX_TIME";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {message}")]
    EnvError { var: &'static str, message: String },

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Configuration for a runtime context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Selects the canned budget profile
    pub mode: ExecutionMode,

    /// Explicit limits; overrides the profile when set
    pub budget: Option<Budget>,

    pub retry: RetryPolicy,

    pub circuit_breaker: CircuitBreakerConfig,

    /// Tasks in flight per round in parallel mode
    pub max_workers: usize,

    /// Maximum cached task results
    pub cache_capacity: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Quick,
            budget: None,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_workers: 4,
            cache_capacity: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Default config for an execution mode.
    pub fn for_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Apply `SCRIPTORIUM_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse().map_err(|e: scriptorium_core::UnknownMode| {
                ConfigError::EnvError {
                    var: ENV_MODE,
                    message: e.to_string(),
                }
            })?;
        }

        if let Some(workers) = lookup(ENV_MAX_WORKERS) {
            self.max_workers = workers.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::EnvError {
                    var: ENV_MAX_WORKERS,
                    message: e.to_string(),
                }
            })?;
        }

        if let Some(max_time) = lookup(ENV_MAX_TIME) {
            let max_time = humantime::parse_duration(max_time.trim()).map_err(|e| {
                ConfigError::EnvError {
                    var: ENV_MAX_TIME,
                    message: e.to_string(),
                }
            })?;
            let mut budget = self.effective_budget();
            budget.max_time = max_time;
            self.budget = Some(budget);
        }

        self.validate()?;
        Ok(self)
    }

    /// The budget actually enforced: the explicit one, or the mode's profile.
    pub fn effective_budget(&self) -> Budget {
        self.budget
            .clone()
            .unwrap_or_else(|| Budget::for_mode(self.mode))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if let Some(budget) = &self.budget {
            if !(budget.warn_ratio > 0.0 && budget.warn_ratio <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "budget.warn_ratio must be in (0, 1], got {}",
                    budget.warn_ratio
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mode, ExecutionMode::Quick);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.effective_budget(), Budget::quick());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
mode: deep
max_workers: 8
retry:
  max_retries: 1
  base_delay: 500ms
circuit_breaker:
  failure_threshold: 2
  recovery_timeout: 10s
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.mode, ExecutionMode::Deep);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(10));
        assert_eq!(config.effective_budget(), Budget::deep());
    }

    #[test]
    fn test_from_json_with_budget() {
        let json = r#"{
            "budget": {"max_tokens": 100, "max_time": 60, "max_api_calls": 5, "max_chunks": 5}
        }"#;
        let config = RuntimeConfig::from_json(json).unwrap();
        let budget = config.effective_budget();

        assert_eq!(budget.max_tokens, 100);
        assert_eq!(budget.max_time, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let err = RuntimeConfig::from_json(r#"{"max_workers": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_MODE, "deep"),
            (ENV_MAX_WORKERS, "2"),
            (ENV_MAX_TIME, "10m"),
        ]);
        let config = RuntimeConfig::default()
            .apply_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mode, ExecutionMode::Deep);
        assert_eq!(config.max_workers, 2);

        // Time override keeps the deep profile's other limits.
        let budget = config.effective_budget();
        assert_eq!(budget.max_time, Duration::from_secs(600));
        assert_eq!(budget.max_tokens, Budget::deep().max_tokens);
    }

    #[test]
    fn test_bad_env_value() {
        let err = RuntimeConfig::default()
            .apply_overrides(|var| (var == ENV_MODE).then(|| "thorough".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { var: ENV_MODE, .. }));
    }
}
