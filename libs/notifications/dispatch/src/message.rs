//! Notification message model
//!
//! `NotificationMessage` is the unit of work that flows from the broker
//! through a worker pool. `DeliveryOutcome` is what a channel sender reports
//! for one attempt, and `AttemptRecord` keeps the history of those attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Delivery medium of a notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Webhook => "webhook",
        }
    }
}

/// A notification travelling through the dispatch pipeline.
///
/// Everything except `attempt` is fixed once the message has been decoded.
/// `attempt` is the zero-based index of the next delivery attempt, which is
/// also the number of attempts already made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    pub channel: Channel,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl NotificationMessage {
    /// Retry budget of messages built without one
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(channel: Channel, recipient: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel,
            recipient: recipient.into(),
            payload,
            attempt: 0,
            enqueued_at: Utc::now(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            idempotency_key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Key used for duplicate suppression.
    pub fn dedup_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.id)
    }

    /// Upper bound on delivery attempts for this message.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Copy scheduled for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Why an incoming delivery could not be turned into a message.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
}

/// Shape accepted on the wire. Publishers may omit bookkeeping fields.
///
/// `attempt` is not read: the engine counts attempts itself, so every
/// decoded message starts at 0 whatever the publisher sent.
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    channel: String,
    recipient: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

impl NotificationMessage {
    /// Decode a broker body.
    ///
    /// `default_max_retries` resolves the retry budget for messages that do
    /// not carry one.
    pub fn decode(
        body: &[u8],
        default_max_retries: impl Fn(Channel) -> u32,
    ) -> Result<Self, DecodeError> {
        let wire: WireMessage =
            serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let channel: Channel = wire
            .channel
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| DecodeError::UnknownChannel(wire.channel.clone()))?;

        if wire.recipient.trim().is_empty() {
            return Err(DecodeError::Malformed("recipient must not be empty".into()));
        }

        Ok(Self {
            id: wire
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            channel,
            recipient: wire.recipient,
            payload: wire.payload,
            attempt: 0,
            enqueued_at: wire.enqueued_at.unwrap_or_else(Utc::now),
            max_retries: wire.max_retries.unwrap_or_else(|| default_max_retries(channel)),
            idempotency_key: wire.idempotency_key,
        })
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl DeliveryOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryOutcome::TransientFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        DeliveryOutcome::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Success => None,
            DeliveryOutcome::TransientFailure(r) | DeliveryOutcome::PermanentFailure(r) => Some(r),
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::TransientFailure(_) => "transient_failure",
            DeliveryOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// One entry of a message's attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn default_retries(_: Channel) -> u32 {
        2
    }

    #[test]
    fn test_decode_fills_defaults() {
        let body = json!({
            "channel": "email",
            "recipient": "user@example.com",
            "payload": {"subject": "Hi", "body": "Hello"}
        });

        let message =
            NotificationMessage::decode(&serde_json::to_vec(&body).unwrap(), default_retries)
                .unwrap();

        assert_eq!(message.channel, Channel::Email);
        assert_eq!(message.attempt, 0);
        assert_eq!(message.max_retries, 2);
        assert!(!message.id.is_empty());
        assert_eq!(message.dedup_key(), message.id);
    }

    #[test]
    fn test_decode_ignores_attempt_from_publisher() {
        let body = json!({
            "channel": "sms",
            "recipient": "+15550100",
            "attempt": 5,
            "max_retries": 2
        });

        let message =
            NotificationMessage::decode(&serde_json::to_vec(&body).unwrap(), default_retries)
                .unwrap();

        assert_eq!(message.attempt, 0);
        assert_eq!(message.max_retries, 2);
    }

    #[test]
    fn test_decode_unknown_channel() {
        let body = json!({"channel": "carrier_pigeon", "recipient": "coop-7"});
        let err = NotificationMessage::decode(&serde_json::to_vec(&body).unwrap(), default_retries)
            .unwrap_err();
        assert_eq!(err, DecodeError::UnknownChannel("carrier_pigeon".into()));
    }

    #[test]
    fn test_decode_malformed() {
        let err = NotificationMessage::decode(b"{not json", default_retries).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));

        let body = json!({"channel": "sms", "recipient": "  "});
        let err = NotificationMessage::decode(&serde_json::to_vec(&body).unwrap(), default_retries)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_message_keeps_explicit_retry_budget_and_key() {
        let message = NotificationMessage::new(Channel::Push, "device-token", json!({}))
            .with_max_retries(5)
            .with_idempotency_key("order-42");
        let decoded =
            NotificationMessage::decode(&message.to_json().unwrap(), default_retries).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.dedup_key(), "order-42");
        assert_eq!(decoded.max_attempts(), 6);
    }

    #[test]
    fn test_next_attempt_only_changes_attempt() {
        let message = NotificationMessage::new(Channel::Sms, "+15550100", json!({"body": "x"}));
        let next = message.next_attempt();
        assert_eq!(next.attempt, 1);
        assert_eq!(next.id, message.id);
        assert_eq!(next.enqueued_at, message.enqueued_at);
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let json = serde_json::to_value(DeliveryOutcome::transient("timeout")).unwrap();
        assert_eq!(json, json!({"kind": "transient_failure", "reason": "timeout"}));
        assert_eq!(DeliveryOutcome::Success.reason(), None);
    }
}
