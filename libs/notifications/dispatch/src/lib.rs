//! Notification Dispatch Engine
//!
//! Consumes notifications from an AMQP-style broker and delivers them over
//! email, SMS, push and webhooks.
//!
//! ## Features
//!
//! - **Per-channel worker pools**: bounded inbound queue, `concurrency` workers
//! - **Rate limiting**: token bucket per channel, `rate_limit` sends per minute
//! - **Retries**: exponential backoff without holding a worker
//! - **Dead-lettering**: failure reason and attempt history published to the DLX
//! - **Reconnects**: topology redeclared on every new channel
//! - **Deduplication**: optional idempotency window for broker redeliveries
//! - **Dead-letter management**: queue stats, listing, bulk reprocess, purge
//!   and a threshold monitor
//!
//! ## Example
//!
//! ```ignore
//! use notification_dispatch::{InMemoryBroker, NotificationConfig, NotificationEngine};
//!
//! let config = NotificationConfig::load_with_env("config.yaml")?;
//! let engine = NotificationEngine::new(&config, Arc::new(InMemoryBroker::new()), senders)?;
//! let mut events = engine.subscribe();
//! engine.run(shutdown_rx).await?;
//! ```

pub mod broker;
pub mod config;
mod dedup;
mod dispatcher;
mod dlq;
mod engine;
mod error;
mod event;
mod message;
pub mod metrics;
mod publisher;
mod rate_limiter;
mod retry;
pub mod sender;
mod shutdown;
mod tracker;
mod worker_pool;

pub use broker::{
    AckHandle, BrokerChannel, BrokerClient, BrokerConnection, BrokerError, Delivery,
    ExchangeType, Headers, InMemoryBroker, QueuedMessage, ReconnectPolicy, Topology,
};
pub use config::{ChannelConfig, NotificationConfig};
pub use dedup::{DedupStore, InMemoryDedupStore};
pub use dispatcher::{Dispatcher, Route};
pub use dlq::{
    DeadLetterEntry, DeadLetterMonitor, DeadLetterQueueStats, DeadLetterRouter, HEADER_CHANNEL,
    HEADER_FAILURE_REASON, HEADER_REPROCESSED, HEADER_REPROCESSED_AT, HEADER_RETRY_COUNT,
};
pub use engine::NotificationEngine;
pub use error::{DispatchError, ErrorCategory};
pub use event::{DispatchEvent, EventBus};
pub use message::{AttemptRecord, Channel, DecodeError, DeliveryOutcome, NotificationMessage};
pub use publisher::NotificationPublisher;
pub use rate_limiter::RateLimiter;
pub use retry::{RetryDecision, RetryPolicy};
pub use sender::{ChannelSender, ProviderError, ScriptedSender, SenderMap};
pub use worker_pool::{DeliveryJob, PoolContext, WorkerPool};
