//! Lifecycle events published by the engine

use crate::message::{Channel, DeliveryOutcome};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

/// Something that happened to a message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Received {
        message_id: String,
        channel: Channel,
    },
    /// Rejected by the dispatcher, never reached a worker pool
    Rejected {
        message_id: Option<String>,
        channel: Option<String>,
        reason: String,
    },
    Attempted {
        message_id: String,
        channel: Channel,
        attempt: u32,
        outcome: DeliveryOutcome,
    },
    RetryScheduled {
        message_id: String,
        channel: Channel,
        next_attempt: u32,
        delay_ms: u64,
    },
    Delivered {
        message_id: String,
        channel: Channel,
        attempts: u32,
    },
    /// Already delivered inside the dedup window, acked without sending
    Duplicate {
        message_id: String,
        channel: Channel,
        key: String,
    },
    DeadLettered {
        message_id: String,
        channel: Channel,
        attempts: u32,
        reason: String,
    },
    /// Dead-letter publication failed for good
    DeadLetterLost {
        message_id: String,
        channel: Channel,
        reason: String,
    },
}

impl DispatchEvent {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::Rejected { message_id, .. } => message_id.as_deref(),
            DispatchEvent::Received { message_id, .. }
            | DispatchEvent::Attempted { message_id, .. }
            | DispatchEvent::RetryScheduled { message_id, .. }
            | DispatchEvent::Delivered { message_id, .. }
            | DispatchEvent::Duplicate { message_id, .. }
            | DispatchEvent::DeadLettered { message_id, .. }
            | DispatchEvent::DeadLetterLost { message_id, .. } => Some(message_id),
        }
    }

    /// Whether the message reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchEvent::Rejected { .. }
                | DispatchEvent::Delivered { .. }
                | DispatchEvent::Duplicate { .. }
                | DispatchEvent::DeadLettered { .. }
                | DispatchEvent::DeadLetterLost { .. }
        )
    }
}

/// Broadcast fan-out of [`DispatchEvent`]s. Slow subscribers lag, they never
/// block the pipeline.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
