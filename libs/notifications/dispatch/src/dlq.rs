//! Dead-letter routing
//!
//! Messages that exhausted their retries, or failed permanently, are
//! published to the dead-letter exchange together with the failure reason
//! and the full attempt history. The original broker delivery is acked only
//! once that publish has succeeded.
//!
//! The dead-letter queues can also be inspected and drained: per-queue
//! stats, a non-destructive listing, bulk reprocessing and purge. A monitor
//! loop polls the stats and warns once a queue reaches the alert threshold.

use crate::broker::{AckHandle, BrokerChannel, BrokerConnection, BrokerError, Delivery, Headers};
use crate::error::DispatchError;
use crate::event::{DispatchEvent, EventBus};
use crate::message::{AttemptRecord, Channel, NotificationMessage};
use crate::metrics::{self, ChannelMetrics};
use crate::publisher::NotificationPublisher;
use crate::shutdown;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const HEADER_FAILURE_REASON: &str = "x-failure-reason";
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_CHANNEL: &str = "x-channel";
pub const HEADER_REPROCESSED: &str = "x-reprocessed-from-dlq";
pub const HEADER_REPROCESSED_AT: &str = "x-reprocessed-at";

/// Set by the broker on messages rejected from a queue
const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";
const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";

const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
const DEFAULT_PUBLISH_BACKOFF: Duration = Duration::from_millis(100);

/// Body published to the dead-letter exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: NotificationMessage,
    pub reason: String,
    pub attempts: Vec<AttemptRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: NotificationMessage, reason: impl Into<String>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            message,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn from_json(body: &[u8]) -> Result<Self, DispatchError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Read a message back from a dead-letter queue.
    ///
    /// Besides entries published by [`DeadLetterRouter::route`], a queue also
    /// holds raw notifications the broker dead-lettered on rejection. Those
    /// come back with an empty history and the broker's rejection reason.
    pub fn from_queued(body: &[u8], headers: &Headers) -> Result<Self, DispatchError> {
        if let Ok(entry) = Self::from_json(body) {
            return Ok(entry);
        }

        let message = NotificationMessage::decode(body, |_| NotificationMessage::DEFAULT_MAX_RETRIES)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let reason = match (
            headers.get(HEADER_FIRST_DEATH_REASON),
            headers.get(HEADER_FIRST_DEATH_QUEUE),
        ) {
            (Some(reason), Some(queue)) => format!("{reason} by {queue}"),
            (Some(reason), None) => reason.clone(),
            _ => "rejected".to_string(),
        };
        Ok(Self::new(message, reason, Vec::new()))
    }

    fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_FAILURE_REASON.into(), self.reason.clone());
        headers.insert(HEADER_RETRY_COUNT.into(), self.message.attempt.to_string());
        headers.insert(HEADER_CHANNEL.into(), self.message.channel.to_string());
        headers
    }
}

/// Depth of one dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterQueueStats {
    pub queue: String,
    pub channel: Channel,
    pub message_count: usize,
}

/// Polling settings for [`DeadLetterRouter::monitor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterMonitor {
    pub interval: Duration,
    /// Queue depth at which a warning is logged
    pub alert_threshold: usize,
}

impl Default for DeadLetterMonitor {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            alert_threshold: 10,
        }
    }
}

/// Publishes failed messages to the dead-letter exchange.
pub struct DeadLetterRouter {
    connection: Arc<BrokerConnection>,
    publisher: NotificationPublisher,
    events: EventBus,
    publish_attempts: u32,
    backoff: Duration,
}

impl DeadLetterRouter {
    pub fn new(connection: Arc<BrokerConnection>, events: EventBus) -> Self {
        Self {
            publisher: NotificationPublisher::new(connection.clone()),
            connection,
            events,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            backoff: DEFAULT_PUBLISH_BACKOFF,
        }
    }

    /// Publish attempts before a message is reported lost (at least 1)
    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    /// Base backoff between publish attempts, doubled each time
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.connection.topology().dead_letter_exchange
    }

    /// Dead-letter `message` and settle its broker delivery.
    ///
    /// On success the delivery is acked. If every publish attempt fails the
    /// loss is logged, a [`DispatchEvent::DeadLetterLost`] is emitted and the
    /// delivery is rejected without requeue so the queue's own dead-letter
    /// exchange still receives the raw message.
    pub async fn route(
        &self,
        message: NotificationMessage,
        reason: impl Into<String>,
        history: Vec<AttemptRecord>,
        ack: AckHandle,
    ) -> Result<(), DispatchError> {
        let entry = DeadLetterEntry::new(message, reason, history);
        let message_id = entry.message.id.clone();
        let channel = entry.message.channel;

        match self.publish_entry(&entry).await {
            Ok(()) => {
                ChannelMetrics::new(channel).dead_lettered();
                info!(
                    message_id = %message_id,
                    channel = %channel,
                    attempts = entry.attempts.len(),
                    reason = %entry.reason,
                    "Moved message to dead-letter exchange"
                );
                if let Err(e) = ack.ack().await {
                    warn!(message_id = %message_id, error = %e, "Failed to ack dead-lettered delivery");
                }
                self.events.emit(DispatchEvent::DeadLettered {
                    message_id,
                    channel,
                    attempts: entry.attempts.len() as u32,
                    reason: entry.reason,
                });
                Ok(())
            }
            Err(e) => {
                error!(
                    message_id = %message_id,
                    channel = %channel,
                    attempts = self.publish_attempts,
                    error = %e,
                    reason = %entry.reason,
                    "Fatal loss: dead-letter publish failed"
                );
                if let Err(nack_err) = ack.nack(false).await {
                    warn!(message_id = %message_id, error = %nack_err, "Failed to reject delivery");
                }
                self.events.emit(DispatchEvent::DeadLetterLost {
                    message_id: message_id.clone(),
                    channel,
                    reason: e.to_string(),
                });
                Err(DispatchError::DeadLetterPublish {
                    message_id,
                    attempts: self.publish_attempts,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Put a dead-lettered message back on the main exchange with a fresh
    /// retry budget.
    pub async fn reprocess(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        let message = NotificationMessage {
            attempt: 0,
            ..entry.message.clone()
        };

        let mut headers = Headers::new();
        headers.insert(HEADER_REPROCESSED.into(), "true".into());
        headers.insert(HEADER_REPROCESSED_AT.into(), Utc::now().to_rfc3339());
        headers.insert(HEADER_RETRY_COUNT.into(), "0".into());

        self.publisher.publish_with_headers(&message, headers).await?;

        info!(
            message_id = %message.id,
            channel = %message.channel,
            previous_reason = %entry.reason,
            "Reprocessed message from dead-letter queue"
        );
        Ok(())
    }

    /// Open channel for queue inspection. Never reconnects.
    fn inspect_channel(&self) -> Result<Arc<dyn BrokerChannel>, DispatchError> {
        self.connection
            .current()
            .ok_or(DispatchError::Broker(BrokerError::ChannelClosed))
    }

    /// Message count of every channel's dead-letter queue.
    pub async fn stats(&self) -> Result<Vec<DeadLetterQueueStats>, DispatchError> {
        let channel = self.inspect_channel()?;
        let topology = self.connection.topology();

        let mut stats = Vec::with_capacity(Channel::ALL.len());
        for kind in Channel::ALL {
            let queue = topology.dead_letter_queue(kind);
            let message_count = channel.queue_depth(&queue).await?;
            stats.push(DeadLetterQueueStats {
                queue,
                channel: kind,
                message_count,
            });
        }
        Ok(stats)
    }

    /// Up to `limit` entries from the head of `channel`'s dead-letter queue.
    ///
    /// Messages are fetched and put back in their original order, so the
    /// queue is unchanged afterwards. Bodies that cannot be read are skipped.
    pub async fn list(&self, channel: Channel, limit: usize) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        let broker = self.inspect_channel()?;
        let queue = self.connection.topology().dead_letter_queue(channel);
        let count = broker.queue_depth(&queue).await?.min(limit);

        let mut fetched: Vec<Delivery> = Vec::with_capacity(count);
        let mut result = Ok(());
        for _ in 0..count {
            match broker.get(&queue).await {
                Ok(Some(delivery)) => fetched.push(delivery),
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let mut entries = Vec::with_capacity(fetched.len());
        for delivery in &fetched {
            match DeadLetterEntry::from_queued(&delivery.body, &delivery.headers) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(queue = %queue, error = %e, "Skipping unreadable dead-letter message"),
            }
        }

        requeue_in_order(fetched).await;
        result?;
        Ok(entries)
    }

    /// Republish every readable message of `channel`'s dead-letter queue
    /// with a fresh retry budget. Returns how many were reprocessed;
    /// unreadable messages stay in the queue.
    pub async fn reprocess_all(&self, channel: Channel) -> Result<usize, DispatchError> {
        let broker = self.inspect_channel()?;
        let queue = self.connection.topology().dead_letter_queue(channel);
        let count = broker.queue_depth(&queue).await?;

        let mut reprocessed = 0;
        let mut skipped = Vec::new();
        let mut result = Ok(());
        for _ in 0..count {
            let delivery = match broker.get(&queue).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            };

            let entry = match DeadLetterEntry::from_queued(&delivery.body, &delivery.headers) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Leaving unreadable message in dead-letter queue");
                    skipped.push(delivery);
                    continue;
                }
            };

            if let Err(e) = self.reprocess(&entry).await {
                skipped.push(delivery);
                result = Err(e);
                break;
            }
            if let Err(e) = delivery.ack.ack().await {
                warn!(message_id = %entry.message.id, error = %e, "Failed to ack reprocessed message");
            }
            reprocessed += 1;
        }

        requeue_in_order(skipped).await;
        info!(queue = %queue, reprocessed, "Reprocessed dead-letter queue");
        result.map(|()| reprocessed)
    }

    /// Drop every message of `channel`'s dead-letter queue.
    pub async fn purge(&self, channel: Channel) -> Result<usize, DispatchError> {
        let broker = self.inspect_channel()?;
        let queue = self.connection.topology().dead_letter_queue(channel);
        let purged = broker.purge(&queue).await?;
        if purged > 0 {
            warn!(queue = %queue, purged, "Purged dead-letter queue");
        }
        Ok(purged)
    }

    /// Poll [`stats`](Self::stats) every `settings.interval` until shutdown.
    /// A failed poll is logged and retried on the next tick.
    pub async fn monitor(&self, settings: DeadLetterMonitor, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = settings.interval.as_secs(),
            alert_threshold = settings.alert_threshold,
            "Dead-letter monitor started"
        );

        loop {
            if shutdown::sleep_or_shutdown(settings.interval, &mut shutdown).await {
                break;
            }

            match self.stats().await {
                Ok(stats) => {
                    for stat in stats {
                        metrics::dead_letter_queue_depth(&stat.queue, stat.message_count);
                        if stat.message_count >= settings.alert_threshold {
                            warn!(
                                queue = %stat.queue,
                                message_count = stat.message_count,
                                threshold = settings.alert_threshold,
                                "Dead-letter queue above alert threshold"
                            );
                        } else if stat.message_count > 0 {
                            info!(
                                queue = %stat.queue,
                                message_count = stat.message_count,
                                "Dead-letter queue has messages"
                            );
                        }
                    }
                }
                Err(e) => debug!(error = %e, "Dead-letter stats unavailable"),
            }
        }

        info!("Dead-letter monitor stopped");
    }

    async fn publish_entry(&self, entry: &DeadLetterEntry) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(entry).map_err(|e| BrokerError::PublishRejected(e.to_string()))?;
        let exchange = self.dead_letter_exchange();
        let routing_key = entry.message.channel.as_str();

        let mut last_error = BrokerError::ChannelClosed;
        for attempt in 0..self.publish_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.saturating_mul(1 << (attempt - 1).min(16))).await;
            }

            let Some(channel) = self.connection.current() else {
                last_error = BrokerError::ChannelClosed;
                warn!(message_id = %entry.message.id, attempt, "No open broker channel for dead-letter publish");
                continue;
            };

            match channel
                .publish(exchange, routing_key, body.clone(), entry.headers())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        message_id = %entry.message.id,
                        attempt,
                        error = %e,
                        "Dead-letter publish failed"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

/// Put fetched deliveries back, last first, so they keep their queue order.
async fn requeue_in_order(deliveries: Vec<Delivery>) {
    for delivery in deliveries.into_iter().rev() {
        if let Err(e) = delivery.ack.nack(true).await {
            warn!(error = %e, "Failed to return message to dead-letter queue");
        }
    }
}
