//! SMS channel via the Twilio REST API.

use super::{outcome_of, payload_str, ChannelSender, ProviderError};
use crate::config::TwilioSettings;
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TWILIO_API_URL: &str = "https://api.twilio.com/2010-04-01";

/// SMS provider client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsClient: Send + Sync {
    /// Send one text message, returning the provider message id if any.
    async fn send_sms(&self, to: &str, body: &str) -> Result<Option<String>, ProviderError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    message: Option<String>,
}

pub struct TwilioClient {
    client: Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioClient {
    pub fn new(settings: &TwilioSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: TWILIO_API_URL.to_string(),
            account_sid: settings.account_sid.clone(),
            auth_token: settings.auth_token.clone(),
            from_number: settings.from_number.clone(),
        })
    }

    /// Point the client at another API root (sandboxes, test servers).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.api_url.trim_end_matches('/'),
            self.account_sid
        )
    }
}

#[async_trait]
impl SmsClient for TwilioClient {
    async fn send_sms(&self, to: &str, body: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let message: TwilioMessage = response.json().await?;
            return Ok(message.sid);
        }

        let message = response
            .json::<TwilioError>()
            .await
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| status.to_string());

        Err(ProviderError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn name(&self) -> &'static str {
        "twilio"
    }
}

/// E.164: `+` followed by 8 to 15 digits.
pub(crate) fn is_e164(number: &str) -> bool {
    number
        .strip_prefix('+')
        .is_some_and(|digits| (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()))
}

pub struct SmsSender {
    client: Arc<dyn SmsClient>,
}

impl SmsSender {
    pub fn new(client: Arc<dyn SmsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome {
        let to = message.recipient.trim();
        if !is_e164(to) {
            return ProviderError::InvalidRecipient(to.to_string()).into_outcome();
        }
        let Some(body) = payload_str(&message.payload, "body") else {
            return ProviderError::InvalidPayload("missing 'body'".into()).into_outcome();
        };

        debug!(message_id = %message.id, provider = self.client.name(), "Sending SMS");

        outcome_of(self.client.send_sms(to, body).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_e164_validation() {
        assert!(is_e164("+15550100123"));
        assert!(is_e164("+4915112345678"));
        assert!(!is_e164("15550100123"));
        assert!(!is_e164("+1555"));
        assert!(!is_e164("+1555-010-0123"));
        assert!(!is_e164("+1234567890123456"));
    }

    #[test]
    fn test_messages_url() {
        let settings = TwilioSettings {
            account_sid: "AC123".into(),
            auth_token: "token".into(),
            from_number: "+15550100000".into(),
        };
        let client = TwilioClient::new(&settings, Duration::from_secs(5))
            .unwrap()
            .with_api_url("http://localhost:4010/");
        assert_eq!(
            client.messages_url(),
            "http://localhost:4010/Accounts/AC123/Messages.json"
        );
    }

    #[tokio::test]
    async fn test_sender_calls_provider() {
        let mut client = MockSmsClient::new();
        client
            .expect_send_sms()
            .withf(|to, body| to == "+15550100123" && body == "Your code is 1234")
            .times(1)
            .returning(|_, _| Ok(Some("SM1".into())));
        client.expect_name().return_const("mock");

        let sender = SmsSender::new(Arc::new(client));
        let message = NotificationMessage::new(
            Channel::Sms,
            "+15550100123",
            json!({"body": "Your code is 1234"}),
        );

        assert_eq!(sender.send(&message).await, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn test_sender_rejects_bad_number_and_throttling_is_transient() {
        let mut client = MockSmsClient::new();
        client.expect_send_sms().times(1).returning(|_, _| {
            Err(ProviderError::Http {
                status: 429,
                message: "Too Many Requests".into(),
            })
        });
        client.expect_name().return_const("mock");
        let sender = SmsSender::new(Arc::new(client));

        let bad = NotificationMessage::new(Channel::Sms, "555-0100", json!({"body": "x"}));
        assert!(matches!(sender.send(&bad).await, DeliveryOutcome::PermanentFailure(_)));

        let throttled = NotificationMessage::new(Channel::Sms, "+15550100123", json!({"body": "x"}));
        assert!(matches!(
            sender.send(&throttled).await,
            DeliveryOutcome::TransientFailure(_)
        ));
    }
}
