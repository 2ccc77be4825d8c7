//! Duplicate suppression for broker redeliveries
//!
//! Brokers deliver at least once, so a crash between a successful send and
//! the ack redelivers the message. Keys of delivered messages are remembered
//! for a window; a redelivery inside the window is acked without sending.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Store of recently delivered message keys
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether `key` was marked delivered within the window
    async fn is_delivered(&self, key: &str) -> bool;

    async fn mark_delivered(&self, key: &str);
}

/// Process-local store with a TTL per key
pub struct InMemoryDedupStore {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_delivered(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .is_some_and(|delivered_at| delivered_at.elapsed() < self.window)
    }

    async fn mark_delivered(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, delivered_at| now.duration_since(*delivered_at) < self.window);
        entries.insert(key.to_string(), now);
    }
}
