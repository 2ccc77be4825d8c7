//! Push channel via Firebase Cloud Messaging (HTTP v1 API).

use super::{outcome_of, payload_str, ChannelSender, ProviderError};
use crate::config::FirebaseSettings;
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use core_config::ConfigError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FCM_API_URL: &str = "https://fcm.googleapis.com/v1";

/// Push notification ready for the provider
#[derive(Debug, Clone, PartialEq)]
pub struct PushContent {
    /// Device registration token
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushContent {
    /// Payload keys: `title`, `body`, optional flat `data` object.
    pub fn from_message(message: &NotificationMessage) -> Result<Self, ProviderError> {
        let token = message.recipient.trim();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(ProviderError::InvalidRecipient(token.to_string()));
        }

        let title = payload_str(&message.payload, "title")
            .ok_or_else(|| ProviderError::InvalidPayload("missing 'title'".into()))?;
        let body = payload_str(&message.payload, "body")
            .ok_or_else(|| ProviderError::InvalidPayload("missing 'body'".into()))?;

        // FCM only accepts string values in `data`.
        let data = match message.payload.get("data") {
            None | Some(serde_json::Value::Null) => BTreeMap::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            Some(_) => {
                return Err(ProviderError::InvalidPayload("'data' must be an object".into()));
            }
        };

        Ok(Self {
            token: token.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            data,
        })
    }
}

/// Push provider client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Send one push notification, returning the provider message name if any.
    async fn send_push(&self, push: &PushContent) -> Result<Option<String>, ProviderError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    name: Option<String>,
}

/// FCM client. The OAuth access token is obtained outside this process.
pub struct FirebaseClient {
    client: Client,
    api_url: String,
    project_id: String,
    access_token: String,
}

impl FirebaseClient {
    pub fn new(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_url: FCM_API_URL.to_string(),
            project_id: project_id.into(),
            access_token: access_token.into(),
        })
    }

    /// Resolve the project from `project_id` or the service account file.
    pub fn from_settings(settings: &FirebaseSettings, timeout: Duration) -> Result<Self, ConfigError> {
        let project_id = match (&settings.project_id, &settings.credentials_file) {
            (Some(project_id), _) => project_id.clone(),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.clone(),
                    details: e.to_string(),
                })?;
                let credentials: CredentialsFile = serde_json::from_str(&raw)
                    .map_err(|e| ConfigError::Decode(format!("{path}: {e}")))?;
                credentials.project_id
            }
            (None, None) => {
                return Err(ConfigError::MissingField(
                    "services.push.firebase.project_id".into(),
                ));
            }
        };

        let access_token = settings.access_token.clone().ok_or_else(|| {
            ConfigError::MissingField("services.push.firebase.access_token".into())
        })?;

        Self::new(project_id, access_token, timeout)
            .map_err(|e| ConfigError::validation("services.push.firebase", e.to_string()))
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn send_url(&self) -> String {
        format!(
            "{}/projects/{}/messages:send",
            self.api_url.trim_end_matches('/'),
            self.project_id
        )
    }

    fn request_body(push: &PushContent) -> serde_json::Value {
        json!({
            "message": {
                "token": push.token,
                "notification": {
                    "title": push.title,
                    "body": push.body,
                },
                "data": push.data,
            }
        })
    }
}

#[async_trait]
impl PushClient for FirebaseClient {
    async fn send_push(&self, push: &PushContent) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .post(self.send_url())
            .bearer_auth(&self.access_token)
            .json(&Self::request_body(push))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: FcmResponse = response.json().await?;
            return Ok(body.name);
        }

        let message = response.text().await.unwrap_or_else(|_| status.to_string());
        Err(ProviderError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn name(&self) -> &'static str {
        "firebase"
    }
}

pub struct PushSender {
    client: Arc<dyn PushClient>,
}

impl PushSender {
    pub fn new(client: Arc<dyn PushClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome {
        let push = match PushContent::from_message(message) {
            Ok(push) => push,
            Err(e) => return e.into_outcome(),
        };

        debug!(message_id = %message.id, provider = self.client.name(), "Sending push notification");

        outcome_of(self.client.send_push(&push).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: serde_json::Value) -> NotificationMessage {
        NotificationMessage::new(Channel::Push, "device-token-1", payload)
    }

    #[test]
    fn test_content_stringifies_data() {
        let push = PushContent::from_message(&message(json!({
            "title": "Order shipped",
            "body": "Your order is on its way",
            "data": {"order_id": "42", "items": 3}
        })))
        .unwrap();

        assert_eq!(push.data.get("order_id").map(String::as_str), Some("42"));
        assert_eq!(push.data.get("items").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_content_validation() {
        assert!(matches!(
            PushContent::from_message(&message(json!({"body": "b"}))),
            Err(ProviderError::InvalidPayload(_))
        ));
        assert!(matches!(
            PushContent::from_message(&message(json!({"title": "t", "body": "b", "data": [1]}))),
            Err(ProviderError::InvalidPayload(_))
        ));

        let blank = NotificationMessage::new(Channel::Push, "   ", json!({"title": "t", "body": "b"}));
        assert!(matches!(
            PushContent::from_message(&blank),
            Err(ProviderError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_request_shape() {
        let push = PushContent {
            token: "tok".into(),
            title: "t".into(),
            body: "b".into(),
            data: BTreeMap::new(),
        };
        let body = FirebaseClient::request_body(&push);
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["notification"]["title"], "t");

        let client = FirebaseClient::new("demo-project", "token", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.send_url(),
            "https://fcm.googleapis.com/v1/projects/demo-project/messages:send"
        );
    }

    #[test]
    fn test_from_settings_requires_token() {
        let settings = FirebaseSettings {
            credentials_file: None,
            project_id: Some("demo".into()),
            access_token: None,
        };
        let err = FirebaseClient::from_settings(&settings, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(err.to_string().contains("access_token"));
    }

    #[tokio::test]
    async fn test_unregistered_token_is_permanent() {
        let mut client = MockPushClient::new();
        client.expect_send_push().times(1).returning(|_| {
            Err(ProviderError::Http {
                status: 404,
                message: "UNREGISTERED".into(),
            })
        });
        client.expect_name().return_const("mock");

        let sender = PushSender::new(Arc::new(client));
        let outcome = sender
            .send(&message(json!({"title": "t", "body": "b"})))
            .await;
        assert!(matches!(outcome, DeliveryOutcome::PermanentFailure(reason) if reason.contains("UNREGISTERED")));
    }
}
