//! YAML configuration of the notification dispatch engine
//!
//! The file is decoded into [`NotificationConfig`], optionally patched from
//! the environment and validated in a fixed order: app, queue, workers,
//! logging. Numbers carrying range rules stay signed until validation so
//! the error can name the offending field.

use crate::broker::{ExchangeType, ReconnectPolicy, Topology};
use crate::dlq::DeadLetterMonitor;
use crate::message::Channel;
use crate::retry::RetryPolicy;
use core_config::{env_or_default, AppConfig, ConfigError, LoggingConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

const DEFAULT_MAX_RETRY_DELAY_MS: i64 = 300_000;
const DEFAULT_RECONNECT_ATTEMPTS: i64 = 10;
const DEFAULT_PREFETCH: i64 = 64;
const DEFAULT_QUEUE_CAPACITY: i64 = 64;
const DEFAULT_SEND_TIMEOUT_MS: i64 = 30_000;
const DEFAULT_DEAD_LETTER_PUBLISH_ATTEMPTS: i64 = 3;
const DEFAULT_DEAD_LETTER_MONITOR_INTERVAL_SECS: i64 = 300;
const DEFAULT_DEAD_LETTER_ALERT_THRESHOLD: i64 = 10;

/// Root of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub app: AppConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    /// Accepted for compatibility, persistence is not wired.
    #[serde(default)]
    pub database: Option<serde_yaml_ng::Value>,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueType {
    Rabbitmq,
}

/// `queue:` section
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub kind: QueueType,
    pub rabbitmq: RabbitMqConfig,
}

/// `queue.rabbitmq:` section. Delays are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    pub url: String,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    #[serde(default)]
    pub dlx_exchange: String,
    pub max_retries: i64,
    pub retry_delay: i64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: i64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i64,
    #[serde(default = "default_prefetch")]
    pub prefetch: i64,
}

impl RabbitMqConfig {
    /// Dead-letter exchange name, `{exchange}.dlx` when not configured.
    pub fn dead_letter_exchange(&self) -> String {
        if self.dlx_exchange.trim().is_empty() {
            format!("{}.dlx", self.exchange)
        } else {
            self.dlx_exchange.clone()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::validation("queue.rabbitmq.url", "must not be empty"));
        }
        if self.exchange.trim().is_empty() {
            return Err(ConfigError::validation(
                "queue.rabbitmq.exchange",
                "must not be empty",
            ));
        }
        non_negative("queue.rabbitmq.max_retries", self.max_retries)?;
        non_negative("queue.rabbitmq.retry_delay", self.retry_delay)?;
        non_negative("queue.rabbitmq.max_retry_delay", self.max_retry_delay)?;
        non_negative("queue.rabbitmq.reconnect_attempts", self.reconnect_attempts)?;
        in_range("queue.rabbitmq.prefetch", self.prefetch, 0, i64::from(u16::MAX))?;
        Ok(())
    }
}

/// Settings of one channel's worker pool (`workers.<channel>:`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub concurrency: i64,
    /// Sends per minute, 0 is unlimited
    #[serde(default)]
    pub rate_limit: i64,
    /// Overrides `queue.rabbitmq.max_retries`
    #[serde(default)]
    pub max_retries: Option<i64>,
    /// Milliseconds
    #[serde(default)]
    pub send_timeout: Option<i64>,
    #[serde(default)]
    pub queue_capacity: Option<i64>,
}

impl WorkerSettings {
    fn validate(&self, channel: Channel) -> Result<(), ConfigError> {
        let field = |name: &str| format!("workers.{channel}.{name}");

        non_negative(&field("concurrency"), self.concurrency)?;
        non_negative(&field("rate_limit"), self.rate_limit)?;
        if let Some(max_retries) = self.max_retries {
            non_negative(&field("max_retries"), max_retries)?;
        }
        if let Some(timeout) = self.send_timeout {
            in_range(&field("send_timeout"), timeout, 1, i64::MAX)?;
        }
        if let Some(capacity) = self.queue_capacity {
            in_range(&field("queue_capacity"), capacity, 1, i64::from(u32::MAX))?;
        }
        Ok(())
    }
}

/// `workers:` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub email: WorkerSettings,
    #[serde(default)]
    pub sms: WorkerSettings,
    #[serde(default)]
    pub push: WorkerSettings,
    #[serde(default)]
    pub webhook: WorkerSettings,
}

impl WorkersConfig {
    pub fn get(&self, channel: Channel) -> &WorkerSettings {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::Webhook => &self.webhook,
        }
    }
}

/// Resolved, validated settings of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub enabled: bool,
    pub concurrency: usize,
    pub rate_limit: u32,
    pub max_retries: u32,
    pub send_timeout: Duration,
    pub queue_capacity: usize,
}

impl ChannelConfig {
    pub fn new(channel: Channel, concurrency: usize, rate_limit: u32) -> Self {
        Self {
            channel,
            enabled: true,
            concurrency,
            rate_limit,
            max_retries: 3,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS as u64),
            queue_capacity: DEFAULT_QUEUE_CAPACITY as usize,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enabled with at least one worker.
    pub fn is_active(&self) -> bool {
        self.enabled && self.concurrency > 0
    }
}

/// SMTP credentials (`services.email.smtp`)
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum EmailService {
    Smtp { smtp: SmtpSettings },
}

/// Twilio credentials (`services.sms.twilio`)
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum SmsService {
    Twilio { twilio: TwilioSettings },
}

/// Firebase Cloud Messaging settings (`services.push.firebase`)
#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseSettings {
    #[serde(default)]
    pub credentials_file: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// OAuth access token obtained out of band
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum PushService {
    Firebase { firebase: FirebaseSettings },
}

/// `services:` section. Each entry is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub email: Option<EmailService>,
    #[serde(default)]
    pub sms: Option<SmsService>,
    #[serde(default)]
    pub push: Option<PushService>,
}

/// `security:` section, only reported at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_key_enabled: bool,
    #[serde(default)]
    pub jwt_enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// `dispatch:` section
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Seconds a delivered key is remembered, 0 disables deduplication
    #[serde(default)]
    pub dedup_window: i64,
    #[serde(default = "default_dead_letter_publish_attempts")]
    pub dead_letter_publish_attempts: i64,
    /// Seconds between dead-letter queue polls, 0 disables the monitor
    #[serde(default = "default_dead_letter_monitor_interval")]
    pub dead_letter_monitor_interval: i64,
    #[serde(default = "default_dead_letter_alert_threshold")]
    pub dead_letter_alert_threshold: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            dedup_window: 0,
            dead_letter_publish_attempts: DEFAULT_DEAD_LETTER_PUBLISH_ATTEMPTS,
            dead_letter_monitor_interval: DEFAULT_DEAD_LETTER_MONITOR_INTERVAL_SECS,
            dead_letter_alert_threshold: DEFAULT_DEAD_LETTER_ALERT_THRESHOLD,
        }
    }
}

impl DispatchSettings {
    pub fn dedup_window(&self) -> Option<Duration> {
        (self.dedup_window > 0).then(|| Duration::from_secs(self.dedup_window as u64))
    }

    pub fn dead_letter_publish_attempts(&self) -> u32 {
        u32::try_from(self.dead_letter_publish_attempts).unwrap_or(u32::MAX)
    }

    /// Monitor settings, `None` when the poll interval is 0
    pub fn dead_letter_monitor(&self) -> Option<DeadLetterMonitor> {
        (self.dead_letter_monitor_interval > 0).then(|| DeadLetterMonitor {
            interval: Duration::from_secs(self.dead_letter_monitor_interval as u64),
            alert_threshold: usize::try_from(self.dead_letter_alert_threshold).unwrap_or(usize::MAX),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        non_negative("dispatch.dedup_window", self.dedup_window)?;
        non_negative("dispatch.dead_letter_monitor_interval", self.dead_letter_monitor_interval)?;
        non_negative("dispatch.dead_letter_alert_threshold", self.dead_letter_alert_threshold)?;
        in_range(
            "dispatch.dead_letter_publish_attempts",
            self.dead_letter_publish_attempts,
            1,
            i64::from(u32::MAX),
        )
    }
}

impl NotificationConfig {
    /// Decode YAML text without validating it.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str(raw).map_err(|e| ConfigError::Decode(e.to_string()))
    }

    /// Read, decode and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::read(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), applying `NOTIF_APP_PORT` and
    /// `RABBITMQ_URL` before validation.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::read(path.as_ref())?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.app.apply_env_overrides()?;
        self.queue.rabbitmq.url = env_or_default("RABBITMQ_URL", &self.queue.rabbitmq.url);
        Ok(())
    }

    /// Validate sections in order, stopping at the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.app.validate()?;
        self.queue.rabbitmq.validate()?;
        for channel in Channel::ALL {
            self.workers.get(channel).validate(channel)?;
        }
        // Logging enums are closed and checked while decoding.
        self.dispatch.validate()?;
        Ok(())
    }

    /// Resolved settings for `channel`. Call after [`validate`](Self::validate).
    pub fn channel(&self, channel: Channel) -> ChannelConfig {
        let settings = self.workers.get(channel);
        let rabbit = &self.queue.rabbitmq;

        ChannelConfig {
            channel,
            enabled: settings.enabled,
            concurrency: to_usize(settings.concurrency),
            rate_limit: to_u32(settings.rate_limit),
            max_retries: to_u32(settings.max_retries.unwrap_or(rabbit.max_retries)),
            send_timeout: millis(settings.send_timeout.unwrap_or(DEFAULT_SEND_TIMEOUT_MS)),
            queue_capacity: to_usize(
                settings
                    .queue_capacity
                    .unwrap_or(DEFAULT_QUEUE_CAPACITY)
                    .max(1),
            ),
        }
    }

    pub fn channels(&self) -> Vec<ChannelConfig> {
        Channel::ALL.into_iter().map(|c| self.channel(c)).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let rabbit = &self.queue.rabbitmq;
        RetryPolicy::new(millis(rabbit.retry_delay), millis(rabbit.max_retry_delay))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(to_u32(self.queue.rabbitmq.reconnect_attempts))
    }

    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.queue.rabbitmq.prefetch).unwrap_or(u16::MAX)
    }

    /// Broker layout. Every channel gets a queue, including inactive ones,
    /// so their messages reach the dispatcher and are dead-lettered there.
    pub fn topology(&self) -> Topology {
        let rabbit = &self.queue.rabbitmq;
        Topology::new(
            rabbit.exchange.clone(),
            rabbit.exchange_type,
            rabbit.dead_letter_exchange(),
            Channel::ALL.to_vec(),
        )
    }
}

fn non_negative(field: &str, value: i64) -> Result<(), ConfigError> {
    if value < 0 {
        return Err(ConfigError::validation(
            field,
            format!("{value} must not be negative"),
        ));
    }
    Ok(())
}

fn in_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::validation(
            field,
            format!("{value} is out of range (must be between {min} and {max})"),
        ));
    }
    Ok(())
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

fn default_max_retry_delay() -> i64 {
    DEFAULT_MAX_RETRY_DELAY_MS
}

fn default_reconnect_attempts() -> i64 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_prefetch() -> i64 {
    DEFAULT_PREFETCH
}

fn default_dead_letter_publish_attempts() -> i64 {
    DEFAULT_DEAD_LETTER_PUBLISH_ATTEMPTS
}

fn default_dead_letter_monitor_interval() -> i64 {
    DEFAULT_DEAD_LETTER_MONITOR_INTERVAL_SECS
}

fn default_dead_letter_alert_threshold() -> i64 {
    DEFAULT_DEAD_LETTER_ALERT_THRESHOLD
}
