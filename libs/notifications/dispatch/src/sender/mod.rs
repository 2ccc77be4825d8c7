//! Channel senders and provider clients.
//!
//! A [`ChannelSender`] turns a [`NotificationMessage`] into one provider
//! call and reports a [`DeliveryOutcome`]. Provider failures never escape
//! as errors: they are classified into transient or permanent outcomes.
//!
//! Each sender wraps a provider client trait (`EmailClient`, `SmsClient`,
//! `PushClient`, `WebhookClient`) that is built from configuration
//! elsewhere and handed in ready to use.

mod email;
mod mock;
mod push;
mod sms;
mod webhook;

pub use email::{EmailClient, EmailContent, EmailSender, SmtpClient};
pub use mock::{ScriptedSender, SendRecord};
pub use push::{FirebaseClient, PushClient, PushContent, PushSender};
pub use sms::{SmsClient, SmsSender, TwilioClient};
pub use webhook::{HttpWebhookClient, WebhookClient, WebhookRequest, WebhookSender};

#[cfg(test)]
pub use email::MockEmailClient;
#[cfg(test)]
pub use push::MockPushClient;
#[cfg(test)]
pub use sms::MockSmsClient;
#[cfg(test)]
pub use webhook::MockWebhookClient;

use crate::error::ErrorCategory;
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a provider client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Invalid recipient '{0}'")]
    InvalidRecipient(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Provider rejected the message: {0}")]
    Rejected(String),

    #[error("Provider timed out: {0}")]
    Timeout(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::InvalidRecipient(_)
            | ProviderError::InvalidPayload(_)
            | ProviderError::Rejected(_) => ErrorCategory::Permanent,
            ProviderError::Http { status, .. } => classify_status(*status),
            ProviderError::Timeout(_) | ProviderError::Unavailable(_) => ErrorCategory::Transient,
        }
    }

    pub fn into_outcome(self) -> DeliveryOutcome {
        match self.category() {
            ErrorCategory::Transient => DeliveryOutcome::TransientFailure(self.to_string()),
            ErrorCategory::Permanent => DeliveryOutcome::PermanentFailure(self.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_builder() {
            ProviderError::InvalidPayload(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Timeouts, throttling and server errors are worth retrying.
pub fn classify_status(status: u16) -> ErrorCategory {
    match status {
        408 | 425 | 429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Permanent,
    }
}

/// Outcome of a provider call.
pub(crate) fn outcome_of<T>(result: Result<T, ProviderError>) -> DeliveryOutcome {
    match result {
        Ok(_) => DeliveryOutcome::Success,
        Err(e) => e.into_outcome(),
    }
}

/// String field of a JSON payload.
pub(crate) fn payload_str<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// Sends notifications over one channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Attempt delivery once. Never fails, failures are part of the outcome.
    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome;
}

/// Sender per channel
pub type SenderMap = HashMap<Channel, Arc<dyn ChannelSender>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(500), ErrorCategory::Transient);
        assert_eq!(classify_status(503), ErrorCategory::Transient);
        assert_eq!(classify_status(429), ErrorCategory::Transient);
        assert_eq!(classify_status(408), ErrorCategory::Transient);
        assert_eq!(classify_status(400), ErrorCategory::Permanent);
        assert_eq!(classify_status(401), ErrorCategory::Permanent);
        assert_eq!(classify_status(404), ErrorCategory::Permanent);
        assert_eq!(classify_status(302), ErrorCategory::Permanent);
    }

    #[test]
    fn test_provider_error_outcomes() {
        assert!(matches!(
            ProviderError::InvalidRecipient("nobody".into()).into_outcome(),
            DeliveryOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            ProviderError::Timeout("30s".into()).into_outcome(),
            DeliveryOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            ProviderError::Http { status: 502, message: "bad gateway".into() }.into_outcome(),
            DeliveryOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            ProviderError::Http { status: 422, message: "unprocessable".into() }.into_outcome(),
            DeliveryOutcome::PermanentFailure(_)
        ));
    }

    #[test]
    fn test_payload_str_skips_blank_values() {
        let payload = serde_json::json!({"subject": "Hi", "body": "  ", "count": 3});
        assert_eq!(payload_str(&payload, "subject"), Some("Hi"));
        assert_eq!(payload_str(&payload, "body"), None);
        assert_eq!(payload_str(&payload, "count"), None);
        assert_eq!(payload_str(&payload, "missing"), None);
    }
}
