//! In-flight bookkeeping per message id
//!
//! A broker disconnect requeues every unacknowledged delivery while the
//! worker that holds the old copy may still be sending it. The tracker
//! serialises attempts on the same message id and remembers how each one
//! ended, so the redelivered copy either continues the attempt history or
//! is acknowledged without another send.

use crate::message::AttemptRecord;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a released entry is kept for redeliveries to find it
const RETENTION: Duration = Duration::from_secs(600);

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Entry {
    in_flight: bool,
    settled: bool,
    history: Vec<AttemptRecord>,
    touched: Option<Instant>,
}

struct State {
    entries: HashMap<String, Entry>,
    last_pruned: Instant,
}

/// Result of [`DeliveryTracker::claim`]
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the message until it calls `release`. Carries the
    /// attempts recorded by earlier holders.
    Acquired(Vec<AttemptRecord>),
    /// An earlier copy was already delivered or dead-lettered.
    Settled,
}

pub struct DeliveryTracker {
    state: Mutex<State>,
    released: Notify,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                last_pruned: Instant::now(),
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of `message_id`, waiting while another worker holds it.
    ///
    /// `fresh` marks a first delivery that has never been attempted. It
    /// starts a new entry instead of continuing an earlier one, so a message
    /// republished with the same id is sent again.
    pub async fn claim(&self, message_id: &str, fresh: bool) -> Claim {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                state.prune();
                let entry = state.entries.entry(message_id.to_string()).or_default();
                if !entry.in_flight {
                    if fresh {
                        *entry = Entry::default();
                    }
                    if entry.settled {
                        entry.touched = Some(Instant::now());
                        return Claim::Settled;
                    }
                    entry.in_flight = true;
                    entry.touched = Some(Instant::now());
                    return Claim::Acquired(entry.history.clone());
                }
            }

            notified.await;
        }
    }

    /// Give up ownership and record where the message stands.
    pub fn release(&self, message_id: &str, history: &[AttemptRecord], settled: bool) {
        {
            let mut state = self.lock();
            let entry = state.entries.entry(message_id.to_string()).or_default();
            entry.in_flight = false;
            entry.settled = settled;
            entry.history = history.to_vec();
            entry.touched = Some(Instant::now());
        }
        self.released.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State {
    fn prune(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_pruned) < PRUNE_INTERVAL {
            return;
        }
        self.last_pruned = now;
        self.entries.retain(|_, entry| {
            entry.in_flight
                || entry
                    .touched
                    .is_some_and(|touched| now.duration_since(touched) < RETENTION)
        });
    }
}
