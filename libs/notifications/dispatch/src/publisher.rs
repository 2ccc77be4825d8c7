//! Publishing notifications onto the main exchange

use crate::broker::{BrokerConnection, Headers};
use crate::error::DispatchError;
use crate::message::NotificationMessage;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Publishes [`NotificationMessage`]s as JSON with the routing key the
/// topology binds for their channel.
#[derive(Clone)]
pub struct NotificationPublisher {
    connection: Arc<BrokerConnection>,
    shutdown: watch::Receiver<bool>,
}

impl NotificationPublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self {
            connection,
            shutdown,
        }
    }

    /// Give up waiting for the broker once shutdown is requested.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn publish(&self, message: &NotificationMessage) -> Result<(), DispatchError> {
        self.publish_with_headers(message, Headers::new()).await
    }

    #[instrument(skip(self, message, headers), fields(message_id = %message.id, channel = %message.channel))]
    pub async fn publish_with_headers(
        &self,
        message: &NotificationMessage,
        mut headers: Headers,
    ) -> Result<(), DispatchError> {
        let body = message.to_json()?;
        let topology = self.connection.topology();
        let routing_key = topology.routing_key(message.channel);
        headers
            .entry("x-channel".into())
            .or_insert_with(|| message.channel.to_string());

        let mut shutdown = self.shutdown.clone();
        let channel = self.connection.channel(&mut shutdown).await?;
        channel
            .publish(&topology.exchange, &routing_key, body, headers)
            .await?;

        debug!(routing_key = %routing_key, "Published notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeType, InMemoryBroker, ReconnectPolicy, Topology};
    use crate::message::Channel;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_routes_to_channel_queue() {
        let broker = InMemoryBroker::new();
        let topology = Topology::new(
            "notifications",
            ExchangeType::Direct,
            "notifications.dlx",
            vec![Channel::Email, Channel::Sms],
        );
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            topology,
            ReconnectPolicy::default(),
        ));
        let publisher = NotificationPublisher::new(connection);

        let message = NotificationMessage::new(Channel::Sms, "+15550100", json!({"body": "hi"}));
        publisher.publish(&message).await.unwrap();

        let queued = broker.messages_in("notifications.sms");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].routing_key, "sms");
        assert_eq!(queued[0].headers.get("x-channel").map(String::as_str), Some("sms"));
        assert_eq!(broker.queue_depth("notifications.email"), 0);

        let decoded = NotificationMessage::decode(&queued[0].body, |_| 3).unwrap();
        assert_eq!(decoded.id, message.id);
    }
}
