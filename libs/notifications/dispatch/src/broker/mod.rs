//! Message broker abstraction
//!
//! The engine talks to an AMQP-style broker through two traits:
//! [`BrokerClient`] opens channels and [`BrokerChannel`] declares topology,
//! consumes, publishes and settles deliveries. Queue inspection (depth, get,
//! purge) backs the dead-letter management operations. [`InMemoryBroker`] is the
//! in-process implementation used by tests and local runs.

mod connection;
mod memory;
mod topology;

pub use connection::{BrokerConnection, ReconnectPolicy};
pub use memory::{InMemoryBroker, QueuedMessage};
pub use topology::Topology;

use crate::error::ErrorCategory;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use strum::{Display, EnumString};
use thiserror::Error;

/// Message headers. Values are kept as strings on the wire.
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries from one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeType {
    Topic,
    Direct,
    Fanout,
}

/// Errors returned by broker operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Exchange '{0}' not found")]
    ExchangeNotFound(String),

    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Topology conflict: {0}")]
    Topology(String),
}

impl BrokerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::Connection(_)
            | BrokerError::ChannelClosed
            | BrokerError::PublishRejected(_) => ErrorCategory::Transient,
            BrokerError::ExchangeNotFound(_)
            | BrokerError::QueueNotFound(_)
            | BrokerError::UnknownDeliveryTag(_)
            | BrokerError::Topology(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether the channel must be reopened before further use.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::ChannelClosed)
    }
}

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`; the original key is kept when unset
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: Option<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }
}

/// Factory for broker channels.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// An open channel to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Start consuming. `prefetch` bounds unacknowledged deliveries, 0 means unbounded.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError>;

    /// Messages ready in `queue`, not counting unacknowledged deliveries.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Fetch one message without a consumer (`basic.get`). The returned
    /// delivery must be settled like a consumed one.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Drop every ready message of `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<usize, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Settles one delivery on the channel that produced it.
///
/// Consumed on use so a delivery is settled at most once. Dropping the
/// handle leaves the delivery unacknowledged; the broker redelivers it when
/// the channel closes.
pub struct AckHandle {
    delivery_tag: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl AckHandle {
    pub fn new(delivery_tag: u64, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            delivery_tag,
            channel,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the delivery can still be settled. Once its channel closes
    /// the broker has already requeued it.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.channel.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

/// A message handed out by a consumer
#[derive(Debug)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub routing_key: String,
    pub redelivered: bool,
    pub ack: AckHandle,
}
