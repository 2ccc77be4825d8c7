pub mod app;
pub mod logging;
pub mod tracing;

pub use app::AppConfig;
pub use logging::{LogFormat, LogLevel, LoggingConfig};

use serde::Deserialize;
use std::env;
use strum::{Display, EnumString};
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Failed to read config file '{path}': {details}")]
    Io { path: String, details: String },

    #[error("Failed to decode config: {0}")]
    Decode(String),

    #[error("Missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid value for '{field}': {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Deployment environment of the running service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Environment variable, or `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an optional environment variable and parse it.
///
/// Returns `Ok(None)` when the variable is unset.
pub fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_from_yaml() {
        let env: Environment = serde_yaml_ng::from_str("production").unwrap();
        assert!(env.is_production());
        assert!(!Environment::Staging.is_production());
    }

    #[test]
    fn test_environment_rejects_unknown_value() {
        assert!("qa".parse::<Environment>().is_err());
        assert_eq!(Environment::Staging.to_string(), "staging");
    }

    #[test]
    fn test_env_or_default_without_value() {
        temp_env::with_var_unset("MISSING_VAR", || {
            let result = env_or_default("MISSING_VAR", "default_value");
            assert_eq!(result, "default_value");
        });
    }

    #[test]
    fn test_env_parsed() {
        temp_env::with_var("NOTIF_TEST_PORT", Some("9090"), || {
            let port: Option<i64> = env_parsed("NOTIF_TEST_PORT").unwrap();
            assert_eq!(port, Some(9090));
        });

        temp_env::with_var("NOTIF_TEST_PORT", Some("ninety"), || {
            let err = env_parsed::<i64>("NOTIF_TEST_PORT").unwrap_err();
            assert!(err.to_string().contains("NOTIF_TEST_PORT"));
        });

        temp_env::with_var_unset("NOTIF_TEST_PORT", || {
            assert_eq!(env_parsed::<i64>("NOTIF_TEST_PORT").unwrap(), None);
        });
    }
}
