//! Exchange, queue and binding layout shared by the publisher, the consumer
//! and the dead-letter router.

use super::{BrokerChannel, BrokerError, ExchangeType, QueueOptions};
use crate::message::Channel;
use tracing::debug;

/// Exchange and queue layout used by the engine.
///
/// - main exchange of the configured type
/// - one queue per listed channel named `{exchange}.{channel}`, or a single
///   `{exchange}.all` queue for fanout exchanges
/// - a direct dead-letter exchange with one `{dlx}.{channel}` queue per
///   channel, bound by the channel name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub dead_letter_exchange: String,
    pub channels: Vec<Channel>,
}

impl Topology {
    pub fn new(
        exchange: impl Into<String>,
        exchange_type: ExchangeType,
        dead_letter_exchange: impl Into<String>,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_type,
            dead_letter_exchange: dead_letter_exchange.into(),
            channels,
        }
    }

    /// Routing key a publisher uses for `channel`.
    pub fn routing_key(&self, channel: Channel) -> String {
        match self.exchange_type {
            ExchangeType::Topic => format!("notification.{channel}"),
            ExchangeType::Direct | ExchangeType::Fanout => channel.to_string(),
        }
    }

    /// Queue that receives messages for `channel`.
    pub fn queue_name(&self, channel: Channel) -> String {
        match self.exchange_type {
            ExchangeType::Fanout => format!("{}.all", self.exchange),
            ExchangeType::Topic | ExchangeType::Direct => format!("{}.{}", self.exchange, channel),
        }
    }

    pub fn dead_letter_queue(&self, channel: Channel) -> String {
        format!("{}.{}", self.dead_letter_exchange, channel)
    }

    /// Queues the dispatcher consumes from, without duplicates.
    pub fn consume_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for channel in &self.channels {
            let queue = self.queue_name(*channel);
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        queues
    }

    /// Declare every exchange, queue and binding. Declarations are idempotent.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        channel
            .declare_exchange(&self.dead_letter_exchange, ExchangeType::Direct)
            .await?;

        for kind in Channel::ALL {
            let queue = self.dead_letter_queue(kind);
            channel.declare_queue(&queue, QueueOptions::durable()).await?;
            channel
                .bind_queue(&queue, &self.dead_letter_exchange, kind.as_str())
                .await?;
        }

        channel
            .declare_exchange(&self.exchange, self.exchange_type)
            .await?;

        for kind in &self.channels {
            let queue = self.queue_name(*kind);

            // Fanout shares one queue, rejected messages keep their original key.
            let dead_letter_key = match self.exchange_type {
                ExchangeType::Fanout => None,
                _ => Some(kind.to_string()),
            };
            channel
                .declare_queue(
                    &queue,
                    QueueOptions::durable()
                        .with_dead_letter(self.dead_letter_exchange.clone(), dead_letter_key),
                )
                .await?;
            channel
                .bind_queue(&queue, &self.exchange, &self.routing_key(*kind))
                .await?;

            debug!(
                queue = %queue,
                exchange = %self.exchange,
                routing_key = %self.routing_key(*kind),
                "Declared channel queue"
            );
        }

        Ok(())
    }
}
