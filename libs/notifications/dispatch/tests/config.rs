mod common;

use common::{config, enable, senders, BASE_CONFIG};
use core_config::ConfigError;
use notification_dispatch::{
    Channel, DispatchError, InMemoryBroker, NotificationConfig, NotificationEngine, ScriptedSender,
};
use std::path::PathBuf;
use std::sync::Arc;

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{name}-{}.yaml", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_out_of_range_port_fails_before_broker_connection() {
    let mut config = config();
    config.app.port = 70000;
    enable(&mut config, Channel::Email, 1, 0);
    let broker = InMemoryBroker::new();

    let result = NotificationEngine::new(
        &config,
        Arc::new(broker.clone()),
        senders(&[Arc::new(ScriptedSender::succeeding(Channel::Email))]),
    );

    match result {
        Err(DispatchError::Config(ConfigError::Validation { field, message })) => {
            assert_eq!(field, "app.port");
            assert!(message.contains("70000"));
        }
        Err(other) => panic!("expected port validation error, got {other}"),
        Ok(_) => panic!("engine accepted port 70000"),
    }
    assert_eq!(broker.connect_attempts(), 0);
}

#[test]
fn test_port_override_from_environment_is_validated() {
    let path = write_config("port-override", BASE_CONFIG);

    temp_env::with_var("NOTIF_APP_PORT", Some("70000"), || {
        let err = NotificationConfig::load_with_env(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "app.port"));
    });

    temp_env::with_var("NOTIF_APP_PORT", Some("9090"), || {
        let config = NotificationConfig::load_with_env(&path).unwrap();
        assert_eq!(config.app.port(), 9090);
    });

    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_rabbitmq_url_override() {
    let path = write_config("url-override", BASE_CONFIG);

    temp_env::with_var("RABBITMQ_URL", Some("amqp://broker.internal:5672/"), || {
        let config = NotificationConfig::load_with_env(&path).unwrap();
        assert_eq!(config.queue.rabbitmq.url, "amqp://broker.internal:5672/");
    });

    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_negative_rate_limit_names_the_worker() {
    let mut config = config();
    enable(&mut config, Channel::Webhook, 1, -5);

    match config.validate() {
        Err(ConfigError::Validation { field, .. }) => assert_eq!(field, "workers.webhook.rate_limit"),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = NotificationConfig::load("/nonexistent/notifications.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
