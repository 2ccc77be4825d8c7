//! Email channel over SMTP (lettre).

use super::{outcome_of, payload_str, ChannelSender, ProviderError};
use crate::config::SmtpSettings;
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Email ready for the provider
#[derive(Debug, Clone, PartialEq)]
pub struct EmailContent {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub reply_to: Option<String>,
}

impl EmailContent {
    /// Build from a notification. Payload keys: `subject`, `body`, optional
    /// `html` and `reply_to`.
    pub fn from_message(message: &NotificationMessage) -> Result<Self, ProviderError> {
        let recipient = message.recipient.trim();
        recipient
            .parse::<Address>()
            .map_err(|_| ProviderError::InvalidRecipient(recipient.to_string()))?;

        let subject = payload_str(&message.payload, "subject")
            .ok_or_else(|| ProviderError::InvalidPayload("missing 'subject'".into()))?;
        let html_body = payload_str(&message.payload, "html").map(str::to_string);
        let text_body = payload_str(&message.payload, "body").map(str::to_string);

        if text_body.is_none() && html_body.is_none() {
            return Err(ProviderError::InvalidPayload(
                "missing 'body' or 'html'".into(),
            ));
        }

        Ok(Self {
            to: recipient.to_string(),
            subject: subject.to_string(),
            text_body: text_body.unwrap_or_default(),
            html_body,
            reply_to: payload_str(&message.payload, "reply_to").map(str::to_string),
        })
    }
}

/// Email provider client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailClient: Send + Sync {
    /// Send one email, returning the provider message id if any.
    async fn send_email(&self, email: &EmailContent) -> Result<Option<String>, ProviderError>;

    fn name(&self) -> &'static str;
}

/// SMTP client built from `services.email.smtp`.
pub struct SmtpClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl SmtpClient {
    /// Port 465 uses implicit TLS, 25 and 1025 are plain (local relays and
    /// Mailpit), anything else negotiates STARTTLS.
    pub fn new(settings: &SmtpSettings) -> Result<Self, ProviderError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| ProviderError::InvalidPayload(format!("invalid from address: {e}")))?;

        let mut builder = match settings.port {
            465 => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .map_err(|e| ProviderError::Unavailable(format!("SMTP relay: {e}")))?,
            25 | 1025 => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host),
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| ProviderError::Unavailable(format!("SMTP relay: {e}")))?,
        }
        .port(settings.port);

        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            host: settings.host.clone(),
        })
    }

    fn build_message(&self, email: &EmailContent) -> Result<Message, ProviderError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|_| ProviderError::InvalidRecipient(email.to.clone()))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject);

        if let Some(reply_to) = &email.reply_to {
            let reply_to: Mailbox = reply_to
                .parse()
                .map_err(|e| ProviderError::InvalidPayload(format!("invalid reply_to: {e}")))?;
            builder = builder.reply_to(reply_to);
        }

        let message = match &email.html_body {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(email.text_body.clone()),
        };

        message.map_err(|e| ProviderError::InvalidPayload(format!("failed to build email: {e}")))
    }
}

#[async_trait]
impl EmailClient for SmtpClient {
    async fn send_email(&self, email: &EmailContent) -> Result<Option<String>, ProviderError> {
        let message = self.build_message(email)?;

        let response = self.transport.send(message).await.map_err(|e| {
            warn!(to = %email.to, host = %self.host, error = %e, "SMTP send failed");
            if e.is_permanent() {
                ProviderError::Rejected(e.to_string())
            } else if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Unavailable(e.to_string())
            }
        })?;

        Ok(response.message().next().map(str::to_string))
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

pub struct EmailSender {
    client: Arc<dyn EmailClient>,
}

impl EmailSender {
    pub fn new(client: Arc<dyn EmailClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome {
        let email = match EmailContent::from_message(message) {
            Ok(email) => email,
            Err(e) => return e.into_outcome(),
        };

        debug!(
            message_id = %message.id,
            to = %email.to,
            provider = self.client.name(),
            "Sending email"
        );

        outcome_of(self.client.send_email(&email).await)
    }
}
