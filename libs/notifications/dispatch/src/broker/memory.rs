//! In-process broker
//!
//! Implements exchange routing (topic, direct, fanout and the default
//! exchange), per-queue dead-letter exchanges, prefetch limits and
//! redelivery of unacknowledged messages when a channel goes away.
//! Test hooks can take the broker offline, drop every connection and
//! make publishes fail.

use super::{
    AckHandle, BrokerChannel, BrokerClient, BrokerError, Delivery, DeliveryStream, ExchangeType,
    Headers, QueueOptions,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A message sitting in a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub routing_key: String,
    pub redelivered: bool,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeType,
    bindings: Vec<Binding>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<QueuedMessage>,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    consumer: u64,
    message: QueuedMessage,
}

struct State {
    online: bool,
    epoch: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_id: u64,
    connect_attempts: u32,
    publish_failures: u32,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Broker living inside the process. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    online: true,
                    epoch: 0,
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    unacked: HashMap::new(),
                    next_tag: 0,
                    next_id: 0,
                    connect_attempts: 0,
                    publish_failures: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Drop every open channel. Unacknowledged messages go back to their queues.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            state.epoch += 1;
            let tags: Vec<u64> = state.unacked.keys().copied().collect();
            requeue_tags(&mut state, &tags);
            warn!(epoch = state.epoch, "In-memory broker dropped all connections");
        }
        self.shared.notify.notify_waiters();
    }

    /// Accept or refuse new connections. Going offline also disconnects.
    pub fn set_online(&self, online: bool) {
        self.shared.lock().online = online;
        if !online {
            self.disconnect();
        }
    }

    /// Make the next `count` publishes fail with `PublishRejected`.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.lock().publish_failures = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn exchange_type(&self, exchange: &str) -> Option<ExchangeType> {
        self.shared.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    /// `(queue, routing_key)` pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared.lock().queues.get(queue).map(|q| q.options.clone())
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn messages_in(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every ready message of `queue`.
    pub fn take_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;

        if !state.online {
            return Err(BrokerError::Connection("broker is offline".into()));
        }

        state.next_id += 1;
        let channel = MemoryChannel {
            shared: self.shared.clone(),
            id: state.next_id,
            epoch: state.epoch,
            closed: Arc::new(AtomicBool::new(false)),
        };
        debug!(channel_id = channel.id, "Opened in-memory broker channel");

        Ok(Arc::new(channel))
    }
}

#[derive(Clone)]
struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    epoch: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn open_in(&self, state: &State) -> bool {
        !self.closed.load(Ordering::SeqCst) && state.epoch == self.epoch && state.online
    }

    fn ensure_open(&self, state: &State) -> Result<(), BrokerError> {
        if self.open_in(state) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Move the head of `queue` to the unacked set and wrap it as a delivery.
    fn deliver(&self, state: &mut State, queue: &str, consumer: u64) -> Option<Delivery> {
        let message = state.queues.get_mut(queue)?.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                channel_id: self.id,
                consumer,
                message: message.clone(),
            },
        );

        Some(Delivery {
            body: message.body,
            headers: message.headers,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            ack: AckHandle::new(tag, Arc::new(self.clone())),
        })
    }

    async fn next_delivery(&self, queue: &str, consumer: u64, prefetch: u16) -> Option<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.shared.lock();
                if !self.open_in(&guard) {
                    return None;
                }

                let state = &mut *guard;
                let in_flight = state
                    .unacked
                    .values()
                    .filter(|u| u.consumer == consumer)
                    .count();

                if (prefetch == 0 || in_flight < usize::from(prefetch))
                    && let Some(delivery) = self.deliver(state, queue, consumer)
                {
                    return Some(delivery);
                }
            }

            notified.await;
        }
    }

    fn take_unacked(&self, state: &mut State, tag: u64) -> Result<Unacked, BrokerError> {
        self.ensure_open(state)?;
        match state.unacked.get(&tag) {
            Some(entry) if entry.channel_id == self.id => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(tag)),
        }
        state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Topology(format!(
                "exchange '{name}' already declared as {}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError::Topology(format!(
                "queue '{name}' already declared with different arguments"
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let exists = exchange_state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            exchange_state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        let consumer = {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            state.next_id += 1;
            state.next_id
        };

        let channel = self.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold(channel, move |channel| {
            let queue = queue.clone();
            async move {
                channel
                    .next_delivery(&queue, consumer, prefetch)
                    .await
                    .map(|delivery| (delivery, channel))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;

            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(BrokerError::PublishRejected(format!(
                    "publish to '{exchange}' refused"
                )));
            }

            let message = QueuedMessage {
                body,
                headers,
                routing_key: routing_key.to_string(),
                redelivered: false,
            };
            let routed = route(&mut state, exchange, routing_key, message)?;
            if routed == 0 {
                debug!(exchange = %exchange, routing_key = %routing_key, "Message was unroutable");
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.shared.lock();
        self.ensure_open(&state)?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        state.next_id += 1;
        let consumer = state.next_id;
        Ok(self.deliver(&mut state, queue, consumer))
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let purged = queue_state.ready.len();
        queue_state.ready.clear();
        debug!(queue = %queue, purged, "Purged in-memory queue");
        Ok(purged)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            self.take_unacked(&mut state, delivery_tag)?;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            let entry = self.take_unacked(&mut state, delivery_tag)?;

            if requeue {
                requeue_entry(&mut state, entry);
            } else {
                dead_letter(&mut state, entry)?;
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.shared.lock();
            let tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            requeue_tags(&mut state, &tags);
        }
        self.shared.notify.notify_waiters();
        debug!(channel_id = self.id, "Closed in-memory broker channel");
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.shared.lock();
        self.open_in(&state)
    }
}

fn requeue_tags(state: &mut State, tags: &[u64]) {
    // Newest first, so the oldest message ends up at the queue head.
    let mut tags = tags.to_vec();
    tags.sort_unstable_by(|a, b| b.cmp(a));
    for tag in tags {
        if let Some(entry) = state.unacked.remove(&tag) {
            requeue_entry(state, entry);
        }
    }
}

fn requeue_entry(state: &mut State, entry: Unacked) {
    if let Some(queue) = state.queues.get_mut(&entry.queue) {
        let mut message = entry.message;
        message.redelivered = true;
        queue.ready.push_front(message);
    }
}

fn dead_letter(state: &mut State, entry: Unacked) -> Result<(), BrokerError> {
    let Some(options) = state.queues.get(&entry.queue).map(|q| q.options.clone()) else {
        return Ok(());
    };
    let Some(exchange) = options.dead_letter_exchange else {
        debug!(queue = %entry.queue, "Rejected message dropped, queue has no dead-letter exchange");
        return Ok(());
    };

    let routing_key = options
        .dead_letter_routing_key
        .unwrap_or_else(|| entry.message.routing_key.clone());

    let mut message = entry.message;
    message.redelivered = false;
    message
        .headers
        .insert("x-first-death-queue".into(), entry.queue.clone());
    message
        .headers
        .insert("x-first-death-reason".into(), "rejected".into());
    message.routing_key = routing_key.clone();

    route(state, &exchange, &routing_key, message).map(|_| ())
}

fn route(
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    message: QueuedMessage,
) -> Result<usize, BrokerError> {
    // Default exchange delivers straight to the queue named by the key.
    if exchange.is_empty() {
        return Ok(match state.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.ready.push_back(message);
                1
            }
            None => 0,
        });
    }

    let exchange_state = state
        .exchanges
        .get(exchange)
        .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

    let mut targets: Vec<String> = Vec::new();
    for binding in &exchange_state.bindings {
        let matched = match exchange_state.kind {
            ExchangeType::Fanout => true,
            ExchangeType::Direct => binding.routing_key == routing_key,
            ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }

    let mut delivered = 0;
    for target in targets {
        if let Some(queue) = state.queues.get_mut(&target) {
            queue.ready.push_back(message.clone());
            delivered += 1;
        }
    }
    Ok(delivered)
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
