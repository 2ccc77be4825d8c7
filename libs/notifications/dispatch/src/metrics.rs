//! Dispatch metrics
//!
//! Recorded through the `metrics` facade. Installing a recorder/exporter is
//! left to the host process.

use crate::message::{Channel, DeliveryOutcome};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a delivery pulled from the broker
pub fn message_received() {
    counter!("notification_messages_received_total").increment(1);
}

/// Record a delivery rejected before reaching a worker pool
pub fn message_rejected(reason: &'static str) {
    counter!("notification_rejected_total", "reason" => reason).increment(1);
}

/// Record a failed broker connection attempt
pub fn broker_reconnect_failed() {
    counter!("notification_broker_connect_failures_total").increment(1);
}

/// Messages waiting in a dead-letter queue
pub fn dead_letter_queue_depth(queue: &str, depth: usize) {
    gauge!("notification_dead_letter_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

/// Per-channel metrics helper
#[derive(Clone, Copy, Debug)]
pub struct ChannelMetrics {
    channel: Channel,
}

impl ChannelMetrics {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Record one send attempt and how long it took
    pub fn attempt(&self, outcome: &DeliveryOutcome, duration: Duration) {
        counter!(
            "notification_deliveries_total",
            "channel" => self.channel.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);

        histogram!(
            "notification_send_duration_seconds",
            "channel" => self.channel.as_str()
        )
        .record(duration.as_secs_f64());
    }

    pub fn retry_scheduled(&self) {
        counter!(
            "notification_retries_total",
            "channel" => self.channel.as_str()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "notification_dead_letters_total",
            "channel" => self.channel.as_str()
        )
        .increment(1);
    }

    pub fn duplicate(&self) {
        counter!(
            "notification_duplicates_total",
            "channel" => self.channel.as_str()
        )
        .increment(1);
    }

    /// A job dropped because its broker channel closed under it
    pub fn stale_dropped(&self) {
        counter!(
            "notification_stale_jobs_total",
            "channel" => self.channel.as_str()
        )
        .increment(1);
    }

    /// Jobs buffered in the pool's inbound queue
    pub fn queue_depth(&self, depth: usize) {
        gauge!(
            "notification_queue_depth",
            "channel" => self.channel.as_str()
        )
        .set(depth as f64);
    }
}
