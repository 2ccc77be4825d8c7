//! Webhook channel: JSON POST to the recipient URL.

use super::{outcome_of, ChannelSender, ProviderError};
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outbound webhook call
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: Url,
    pub body: serde_json::Value,
    pub headers: Vec<(String, String)>,
}

impl WebhookRequest {
    /// The recipient is the target URL, the payload is posted as-is.
    pub fn from_message(message: &NotificationMessage) -> Result<Self, ProviderError> {
        let recipient = message.recipient.trim();
        let url = Url::parse(recipient)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
            .ok_or_else(|| ProviderError::InvalidRecipient(recipient.to_string()))?;

        Ok(Self {
            url,
            body: message.payload.clone(),
            headers: vec![
                ("X-Notification-Id".into(), message.id.clone()),
                ("X-Notification-Attempt".into(), message.attempt.to_string()),
                ("Idempotency-Key".into(), message.dedup_key().to_string()),
            ],
        })
    }
}

/// Webhook transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// POST the request, returning the response status.
    async fn post(&self, request: &WebhookRequest) -> Result<u16, ProviderError>;
}

pub struct HttpWebhookClient {
    client: Client,
}

impl HttpWebhookClient {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(&self, request: &WebhookRequest) -> Result<u16, ProviderError> {
        let mut builder = self.client.post(request.url.clone()).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Http {
            status: status.as_u16(),
            message: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        })
    }
}

pub struct WebhookSender {
    client: Arc<dyn WebhookClient>,
}

impl WebhookSender {
    pub fn new(client: Arc<dyn WebhookClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome {
        let request = match WebhookRequest::from_message(message) {
            Ok(request) => request,
            Err(e) => return e.into_outcome(),
        };

        debug!(message_id = %message.id, url = %request.url, "Posting webhook");

        outcome_of(self.client.post(&request).await)
    }
}
