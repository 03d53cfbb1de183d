//! Engine configuration
//!
//! Defaults suit production use; every field can be overridden through
//! `ELIF_INTEGRITY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

const ENV_MAX_DEPTH: &str = "ELIF_INTEGRITY_MAX_DEPTH";
const ENV_SOFT_DELETE: &str = "ELIF_INTEGRITY_SOFT_DELETE";
const ENV_LOG_STATEMENTS: &str = "ELIF_INTEGRITY_LOG_STATEMENTS";

/// Configuration error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Configuration for the delete-policy engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Maximum cascade nesting below the root entity
    pub max_depth: usize,
    /// Honor `soft_delete` type descriptors; when off every removal is physical
    pub soft_delete: bool,
    /// Log every deferred statement at debug level when it is registered
    pub log_statements: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            soft_delete: true,
            log_statements: false,
        }
    }
}

impl IntegrityConfig {
    /// Load the configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = read_env(ENV_MAX_DEPTH) {
            config.max_depth = value.parse().map_err(|_| {
                ConfigError::invalid_value(ENV_MAX_DEPTH, &value, "a positive integer")
            })?;
        }

        if let Some(value) = read_env(ENV_SOFT_DELETE) {
            config.soft_delete = parse_flag(ENV_SOFT_DELETE, &value)?;
        }

        if let Some(value) = read_env(ENV_LOG_STATEMENTS) {
            config.log_statements = parse_flag(ENV_LOG_STATEMENTS, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::validation_failed(
                "max_depth must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_soft_delete(mut self, soft_delete: bool) -> Self {
        self.soft_delete = soft_delete;
        self
    }

    pub fn with_log_statements(mut self, log_statements: bool) -> Self {
        self.log_statements = log_statements;
        self
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(field: &str, value: &str) -> Result<bool, ConfigError> {
    Flag::from_str(value)
        .map(|flag| flag.0)
        .map_err(|_| ConfigError::invalid_value(field, value, "true, false, 1, 0, yes or no"))
}

struct Flag(bool);

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Flag(true)),
            "false" | "0" | "no" | "off" => Ok(Flag(false)),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        env::remove_var(ENV_MAX_DEPTH);
        env::remove_var(ENV_SOFT_DELETE);
        env::remove_var(ENV_LOG_STATEMENTS);
    }

    #[test]
    fn test_default_config() {
        let config = IntegrityConfig::default();
        assert_eq!(config.max_depth, 64);
        assert!(config.soft_delete);
        assert!(!config.log_statements);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        let config = IntegrityConfig::default().with_max_depth(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var(ENV_MAX_DEPTH, "8");
        env::set_var(ENV_SOFT_DELETE, "off");
        env::set_var(ENV_LOG_STATEMENTS, "yes");

        let config = IntegrityConfig::from_env().unwrap();
        assert_eq!(config.max_depth, 8);
        assert!(!config.soft_delete);
        assert!(config.log_statements);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_value() {
        clear_env();
        env::set_var(ENV_MAX_DEPTH, "deep");

        match IntegrityConfig::from_env() {
            Err(ConfigError::InvalidValue { field, value, .. }) => {
                assert_eq!(field, ENV_MAX_DEPTH);
                assert_eq!(value, "deep");
            }
            other => panic!("Expected invalid value error, got {:?}", other),
        }

        clear_env();
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: IntegrityConfig = serde_json::from_str(r#"{"max_depth": 3}"#).unwrap();
        assert_eq!(config.max_depth, 3);
        assert!(config.soft_delete);
    }
}
