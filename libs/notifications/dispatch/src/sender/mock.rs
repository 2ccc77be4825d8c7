//! Scripted sender for tests and dry runs

use super::ChannelSender;
use crate::message::{Channel, DeliveryOutcome, NotificationMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One recorded call to [`ScriptedSender::send`]
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub message_id: String,
    pub attempt: u32,
    pub started_at: Instant,
}

/// Sender that replays a list of outcomes and records every call.
///
/// Once the script is used up every call returns the fallback outcome.
pub struct ScriptedSender {
    channel: Channel,
    script: Mutex<VecDeque<DeliveryOutcome>>,
    fallback: DeliveryOutcome,
    latency: Duration,
    records: Mutex<Vec<SendRecord>>,
}

impl ScriptedSender {
    /// Sender that always succeeds
    pub fn succeeding(channel: Channel) -> Self {
        Self::always(channel, DeliveryOutcome::Success)
    }

    /// Sender that always returns `outcome`
    pub fn always(channel: Channel, outcome: DeliveryOutcome) -> Self {
        Self::scripted(channel, Vec::new(), outcome)
    }

    pub fn scripted(
        channel: Channel,
        script: impl IntoIterator<Item = DeliveryOutcome>,
        fallback: DeliveryOutcome,
    ) -> Self {
        Self {
            channel,
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            latency: Duration::ZERO,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Simulated provider round trip
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn records(&self) -> Vec<SendRecord> {
        self.records.lock().await.clone()
    }

    pub async fn send_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Attempt numbers seen for `message_id`, in call order
    pub async fn attempts_for(&self, message_id: &str) -> Vec<u32> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.message_id == message_id)
            .map(|r| r.attempt)
            .collect()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &NotificationMessage) -> DeliveryOutcome {
        self.records.lock().await.push(SendRecord {
            message_id: message.id.clone(),
            attempt: message.attempt,
            started_at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
