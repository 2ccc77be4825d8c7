use crate::{env_parsed, ConfigError, Environment};
use serde::Deserialize;

/// Application identity section (`app:` in the YAML file)
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub env: Environment,
    /// Kept signed so out-of-range values reach validation instead of failing decode.
    pub port: i64,
}

impl AppConfig {
    pub fn new(name: impl Into<String>, env: Environment, port: u16) -> Self {
        Self {
            name: name.into(),
            env,
            port: i64::from(port),
        }
    }

    /// Validated port. Only meaningful after [`AppConfig::validate`] succeeded.
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or_default()
    }

    /// Apply `NOTIF_APP_PORT` if it is set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = env_parsed::<i64>("NOTIF_APP_PORT")? {
            self.port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::validation("app.name", "must not be empty"));
        }

        if !(1..=65535).contains(&self.port) {
            return Err(ConfigError::validation(
                "app.port",
                format!("{} is out of range (must be between 1 and 65535)", self.port),
            ));
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new("notification-dispatch", Environment::Development, 8080)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_valid() {
        let config = AppConfig::new("notifier", Environment::Production, 3000);
        assert!(config.validate().is_ok());
        assert_eq!(config.port(), 3000);
    }

    #[test]
    fn test_app_config_port_out_of_range() {
        let mut config = AppConfig::default();
        config.port = 70000;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("app.port"));
        assert!(err.to_string().contains("70000"));

        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_empty_name() {
        let config = AppConfig::new("  ", Environment::Development, 8080);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("app.name"));
    }

    #[test]
    fn test_app_config_decodes_environment() {
        let config: AppConfig =
            serde_yaml_ng::from_str("name: notifier\nenv: staging\nport: 8080\n").unwrap();
        assert_eq!(config.env, Environment::Staging);

        let invalid = serde_yaml_ng::from_str::<AppConfig>("name: n\nenv: qa\nport: 1\n");
        assert!(invalid.is_err());
    }

    #[test]
    fn test_app_config_port_env_override() {
        temp_env::with_var("NOTIF_APP_PORT", Some("9100"), || {
            let mut config = AppConfig::default();
            config.apply_env_overrides().unwrap();
            assert_eq!(config.port(), 9100);
        });
    }
}
