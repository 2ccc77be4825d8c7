//! Per-channel worker pool
//!
//! Each pool owns a bounded inbound queue and `concurrency` workers pulling
//! from it. A worker takes one job at a time:
//!
//! 1. skip it if the dedup store already saw its key delivered
//! 2. claim its message id, so no other worker attempts it meanwhile
//! 3. wait for the channel's rate limiter
//! 4. send with a timeout
//! 5. apply the retry policy: ack on success, schedule a delayed
//!    re-insertion on transient failure, dead-letter otherwise
//!
//! Retries are re-inserted by a timer task, so a waiting retry never holds a
//! worker. The broker delivery travels with the job and is settled only once
//! the message is delivered or dead-lettered.
//!
//! A job whose broker channel has closed is stale: the broker has already
//! requeued its delivery. Stale jobs are dropped before a send and before a
//! retry is re-inserted. The redelivered copy picks up the attempt history
//! from the pool's [`DeliveryTracker`].

use crate::broker::AckHandle;
use crate::config::ChannelConfig;
use crate::dedup::DedupStore;
use crate::dlq::DeadLetterRouter;
use crate::event::{DispatchEvent, EventBus};
use crate::message::{AttemptRecord, Channel, DeliveryOutcome, NotificationMessage};
use crate::metrics::ChannelMetrics;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sender::ChannelSender;
use crate::shutdown;
use crate::tracker::{Claim, DeliveryTracker};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// A message in flight together with its broker delivery
#[derive(Debug)]
pub struct DeliveryJob {
    pub message: NotificationMessage,
    pub history: Vec<AttemptRecord>,
    pub ack: AckHandle,
    /// The broker handed this delivery out before
    pub redelivered: bool,
}

impl DeliveryJob {
    pub fn new(message: NotificationMessage, ack: AckHandle) -> Self {
        Self {
            message,
            history: Vec::new(),
            ack,
            redelivered: false,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Never attempted by this engine and not seen by the broker before
    fn is_fresh(&self) -> bool {
        !self.redelivered && self.history.is_empty()
    }

    fn is_stale(&self) -> bool {
        !self.ack.is_open()
    }

    /// Hand the delivery back to the broker for another consumer.
    pub(crate) async fn release(self) {
        let message_id = self.message.id;
        if let Err(e) = self.ack.nack(true).await {
            // Channel already gone; the broker requeues on its own.
            debug!(message_id = %message_id, error = %e, "Could not requeue delivery");
        }
    }
}

/// Collaborators shared by every pool of an engine
#[derive(Clone)]
pub struct PoolContext {
    pub retry_policy: RetryPolicy,
    pub dead_letters: Arc<DeadLetterRouter>,
    pub events: EventBus,
    pub dedup: Option<Arc<dyn DedupStore>>,
}

struct Worker {
    channel: Channel,
    send_timeout: Duration,
    sender: Arc<dyn ChannelSender>,
    limiter: Arc<RateLimiter>,
    context: PoolContext,
    metrics: ChannelMetrics,
    tracker: DeliveryTracker,
    retries: mpsc::Sender<DeliveryJob>,
    scheduled: Arc<Mutex<JoinSet<()>>>,
    shutdown: watch::Receiver<bool>,
}

/// Running pool for one channel
pub struct WorkerPool {
    channel: Channel,
    inbound: mpsc::Sender<DeliveryJob>,
    receiver: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    workers: Vec<JoinHandle<()>>,
    scheduled: Arc<Mutex<JoinSet<()>>>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers for `config.channel`.
    pub fn start(
        config: &ChannelConfig,
        sender: Arc<dyn ChannelSender>,
        context: PoolContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (inbound, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let scheduled = Arc::new(Mutex::new(JoinSet::new()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));

        let worker = Arc::new(Worker {
            channel: config.channel,
            send_timeout: config.send_timeout,
            sender,
            limiter,
            context,
            metrics: ChannelMetrics::new(config.channel),
            tracker: DeliveryTracker::new(),
            retries: inbound.clone(),
            scheduled: scheduled.clone(),
            shutdown: shutdown.clone(),
        });

        let workers = (0..config.concurrency)
            .map(|id| {
                let worker = worker.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(id, receiver, shutdown).await })
            })
            .collect();

        info!(
            channel = %config.channel,
            concurrency = config.concurrency,
            rate_limit = config.rate_limit,
            max_retries = config.max_retries,
            send_timeout_ms = config.send_timeout.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            "Started worker pool"
        );

        Self {
            channel: config.channel,
            inbound,
            receiver,
            workers,
            scheduled,
        }
    }

    /// Sender side of the inbound queue
    pub fn inbound(&self) -> mpsc::Sender<DeliveryJob> {
        self.inbound.clone()
    }

    /// Wait for the workers to stop, then hand queued and scheduled jobs
    /// back to the broker. Call after shutdown has been signalled.
    pub async fn drain(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(channel = %self.channel, error = %e, "Worker task panicked");
            }
        }

        {
            let mut scheduled = self.scheduled.lock().await;
            while scheduled.join_next().await.is_some() {}
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut released = 0usize;
        while let Ok(job) = receiver.try_recv() {
            job.release().await;
            released += 1;
        }

        info!(channel = %self.channel, released, "Worker pool drained");
    }
}

impl Worker {
    async fn run(
        self: Arc<Self>,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(channel = %self.channel, worker = id, "Worker started");

        loop {
            let job = {
                let mut receiver = receiver.lock().await;
                let job = tokio::select! {
                    biased;
                    _ = shutdown::requested(&mut shutdown) => None,
                    job = receiver.recv() => job,
                };
                self.metrics.queue_depth(receiver.len());
                job
            };
            let Some(job) = job else { break };
            if self.drop_stale(&job) {
                continue;
            }
            let Some(job) = self.skip_duplicate(job).await else {
                continue;
            };
            let Some(job) = self.claim(job).await else {
                continue;
            };

            tokio::select! {
                biased;
                _ = shutdown::requested(&mut shutdown) => {
                    self.tracker.release(&job.message.id, &job.history, false);
                    job.release().await;
                    break;
                }
                _ = self.limiter.acquire() => {}
            }

            if self.drop_stale(&job) {
                self.tracker.release(&job.message.id, &job.history, false);
                continue;
            }

            // In flight from here on: finish even if shutdown arrives.
            self.process(job).await;
        }

        debug!(channel = %self.channel, worker = id, "Worker stopped");
    }

    /// Whether `job` lost its broker channel. The caller drops it.
    fn drop_stale(&self, job: &DeliveryJob) -> bool {
        if !job.is_stale() {
            return false;
        }
        debug!(
            message_id = %job.message.id,
            attempt = job.message.attempt,
            "Dropping job from a closed channel, broker redelivers it"
        );
        self.metrics.stale_dropped();
        true
    }

    /// Take the message id for this worker. A redelivered copy continues the
    /// attempt history of earlier copies, or is acked if one already settled.
    async fn claim(&self, mut job: DeliveryJob) -> Option<DeliveryJob> {
        match self.tracker.claim(&job.message.id, job.is_fresh()).await {
            Claim::Acquired(history) => {
                if self.drop_stale(&job) {
                    self.tracker.release(&job.message.id, &history, false);
                    return None;
                }
                if history.len() > job.history.len() {
                    debug!(
                        message_id = %job.message.id,
                        attempts = history.len(),
                        "Continuing attempt history of an earlier delivery"
                    );
                    job.message.attempt = history.len() as u32;
                    job.history = history;
                }
                Some(job)
            }
            Claim::Settled => {
                info!(message_id = %job.message.id, "Earlier delivery already settled, acking copy");
                self.metrics.duplicate();
                if let Err(e) = job.ack.ack().await {
                    warn!(error = %e, "Failed to ack settled delivery");
                }
                self.context.events.emit(DispatchEvent::Duplicate {
                    key: job.message.dedup_key().to_string(),
                    message_id: job.message.id,
                    channel: self.channel,
                });
                None
            }
        }
    }

    /// Ack and drop `job` if its key was already delivered.
    async fn skip_duplicate(&self, job: DeliveryJob) -> Option<DeliveryJob> {
        let Some(dedup) = &self.context.dedup else {
            return Some(job);
        };
        let key = job.message.dedup_key().to_string();
        if !dedup.is_delivered(&key).await {
            return Some(job);
        }

        info!(message_id = %job.message.id, key = %key, "Skipping already delivered message");
        self.metrics.duplicate();
        if let Err(e) = job.ack.ack().await {
            warn!(error = %e, "Failed to ack duplicate delivery");
        }
        self.context.events.emit(DispatchEvent::Duplicate {
            message_id: job.message.id,
            channel: self.channel,
            key,
        });
        None
    }

    #[instrument(skip_all, fields(message_id = %job.message.id, channel = %self.channel, attempt = job.message.attempt))]
    async fn process(&self, mut job: DeliveryJob) {
        let started_at = Utc::now();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.send_timeout, self.sender.send(&job.message))
            .await
            .unwrap_or_else(|_| DeliveryOutcome::transient("timeout"));
        let elapsed = started.elapsed();

        self.metrics.attempt(&outcome, elapsed);
        job.history.push(AttemptRecord {
            attempt: job.message.attempt,
            outcome: outcome.clone(),
            started_at,
            duration_ms: elapsed.as_millis() as u64,
        });
        self.context.events.emit(DispatchEvent::Attempted {
            message_id: job.message.id.clone(),
            channel: self.channel,
            attempt: job.message.attempt,
            outcome: outcome.clone(),
        });

        let decision = self.context.retry_policy.next_action(
            job.message.attempt,
            job.message.max_retries,
            &outcome,
        );

        let settled = !matches!(decision, Some(RetryDecision::RequeueAfter(_)));
        self.tracker.release(&job.message.id, &job.history, settled);

        match decision {
            None => self.complete(job).await,
            Some(RetryDecision::RequeueAfter(delay)) => self.schedule_retry(job, delay, &outcome).await,
            Some(RetryDecision::DeadLetter(reason)) => {
                warn!(reason = %reason, "Delivery failed, dead-lettering");
                let DeliveryJob {
                    message,
                    history,
                    ack,
                    ..
                } = job;
                // Failures are logged and reported by the router.
                let _ = self
                    .context
                    .dead_letters
                    .route(message, reason, history, ack)
                    .await;
            }
        }
    }

    async fn complete(&self, job: DeliveryJob) {
        if let Some(dedup) = &self.context.dedup {
            dedup.mark_delivered(job.message.dedup_key()).await;
        }

        if let Err(e) = job.ack.ack().await {
            // Broker will redeliver; the dedup store catches it if enabled.
            warn!(error = %e, "Delivered but failed to ack broker delivery");
        }

        let attempts = job.history.len() as u32;
        info!(attempts, "Notification delivered");
        self.context.events.emit(DispatchEvent::Delivered {
            message_id: job.message.id,
            channel: self.channel,
            attempts,
        });
    }

    async fn schedule_retry(&self, mut job: DeliveryJob, delay: Duration, outcome: &DeliveryOutcome) {
        job.message = job.message.next_attempt();
        self.metrics.retry_scheduled();
        warn!(
            reason = outcome.reason().unwrap_or_default(),
            next_attempt = job.message.attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retry scheduled"
        );
        self.context.events.emit(DispatchEvent::RetryScheduled {
            message_id: job.message.id.clone(),
            channel: self.channel,
            next_attempt: job.message.attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let retries = self.retries.clone();
        let metrics = self.metrics;
        let mut shutdown = self.shutdown.clone();
        let mut scheduled = self.scheduled.lock().await;
        while scheduled.try_join_next().is_some() {}
        scheduled.spawn(async move {
            if shutdown::sleep_or_shutdown(delay, &mut shutdown).await {
                job.release().await;
                return;
            }
            if job.is_stale() {
                debug!(message_id = %job.message.id, "Channel closed while retry was pending, dropping");
                metrics.stale_dropped();
                return;
            }
            tokio::select! {
                biased;
                _ = shutdown::requested(&mut shutdown) => job.release().await,
                permit = retries.reserve() => match permit {
                    Ok(permit) => permit.send(job),
                    Err(_) => job.release().await,
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerChannel, BrokerConnection, DeliveryStream, ExchangeType, Headers, InMemoryBroker,
        ReconnectPolicy, Topology,
    };
    use crate::dedup::InMemoryDedupStore;
    use crate::dlq::DeadLetterEntry;
    use crate::sender::ScriptedSender;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        broker: InMemoryBroker,
        channel: Arc<dyn BrokerChannel>,
        deliveries: DeliveryStream,
        context: PoolContext,
        events: broadcast::Receiver<DispatchEvent>,
        shutdown: watch::Sender<bool>,
    }

    impl Fixture {
        async fn new() -> Self {
            let broker = InMemoryBroker::new();
            let topology = Topology::new(
                "notifications",
                ExchangeType::Direct,
                "notifications.dlx",
                vec![Channel::Email],
            );
            let connection = Arc::new(BrokerConnection::new(
                Arc::new(broker.clone()),
                topology,
                ReconnectPolicy::default(),
            ));
            let (shutdown, mut rx) = watch::channel(false);
            let channel = connection.channel(&mut rx).await.unwrap();
            let deliveries = channel.consume("notifications.email", 0).await.unwrap();

            let events = EventBus::new();
            let subscriber = events.subscribe();
            let context = PoolContext {
                retry_policy: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
                dead_letters: Arc::new(DeadLetterRouter::new(connection, events.clone())),
                events,
                dedup: None,
            };

            Self {
                broker,
                channel,
                deliveries,
                context,
                events: subscriber,
                shutdown,
            }
        }

        /// Round-trip `message` through the broker so the job carries a real delivery.
        async fn job(&mut self, message: NotificationMessage) -> DeliveryJob {
            self.channel
                .publish("notifications", "email", message.to_json().unwrap(), Headers::new())
                .await
                .unwrap();
            let delivery = self.deliveries.next().await.unwrap();
            DeliveryJob::new(message, delivery.ack)
        }

        fn start(&self, config: &ChannelConfig, sender: Arc<ScriptedSender>) -> WorkerPool {
            WorkerPool::start(config, sender, self.context.clone(), self.shutdown.subscribe())
        }

        async fn next_terminal(&mut self) -> DispatchEvent {
            loop {
                let event = self.events.recv().await.unwrap();
                if event.is_terminal() {
                    return event;
                }
            }
        }
    }

    fn email(max_retries: u32) -> NotificationMessage {
        NotificationMessage::new(Channel::Email, "user@example.com", json!({"subject": "s", "body": "b"}))
            .with_max_retries(max_retries)
    }

    #[tokio::test]
    async fn test_success_acks_delivery() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(ScriptedSender::succeeding(Channel::Email));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 2, 0), sender.clone());

        let message = email(3);
        let job = fixture.job(message.clone()).await;
        pool.inbound().send(job).await.unwrap();

        assert_eq!(
            fixture.next_terminal().await,
            DispatchEvent::Delivered {
                message_id: message.id.clone(),
                channel: Channel::Email,
                attempts: 1,
            }
        );
        assert_eq!(sender.send_count().await, 1);
        assert_eq!(fixture.broker.unacked_count(), 0);
        assert_eq!(fixture.broker.queue_depth("notifications.dlx.email"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(ScriptedSender::always(
            Channel::Email,
            DeliveryOutcome::transient("smtp 451"),
        ));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let message = email(2);
        let job = fixture.job(message.clone()).await;
        pool.inbound().send(job).await.unwrap();

        let event = fixture.next_terminal().await;
        assert!(matches!(event, DispatchEvent::DeadLettered { attempts: 3, .. }));
        assert_eq!(sender.attempts_for(&message.id).await, vec![0, 1, 2]);

        let records = sender.records().await;
        assert!(records[1].started_at - records[0].started_at >= Duration::from_millis(100));
        assert!(records[2].started_at - records[1].started_at >= Duration::from_millis(200));

        let dead = fixture.broker.messages_in("notifications.dlx.email");
        let entry = DeadLetterEntry::from_json(&dead[0].body).unwrap();
        assert_eq!(entry.attempts.len(), 3);
        assert!(entry.reason.contains("3 transient failures"));
        assert_eq!(fixture.broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_once() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(ScriptedSender::always(
            Channel::Email,
            DeliveryOutcome::permanent("mailbox does not exist"),
        ));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let job = fixture.job(email(5)).await;
        pool.inbound().send(job).await.unwrap();

        match fixture.next_terminal().await {
            DispatchEvent::DeadLettered { attempts, reason, .. } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("mailbox does not exist"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(sender.send_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_transient() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(
            ScriptedSender::succeeding(Channel::Email).with_latency(Duration::from_secs(5)),
        );
        let config = ChannelConfig::new(Channel::Email, 1, 0).with_send_timeout(Duration::from_millis(200));
        let pool = fixture.start(&config, sender);

        let job = fixture.job(email(0)).await;
        pool.inbound().send(job).await.unwrap();

        match fixture.next_terminal().await {
            DispatchEvent::DeadLettered { reason, .. } => assert!(reason.contains("timeout")),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_does_not_hold_worker() {
        let mut fixture = Fixture::new().await;
        fixture.context.retry_policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(30));
        let sender = Arc::new(ScriptedSender::scripted(
            Channel::Email,
            vec![DeliveryOutcome::transient("busy")],
            DeliveryOutcome::Success,
        ));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let first = email(1);
        let second = email(1);
        let job = fixture.job(first.clone()).await;
        pool.inbound().send(job).await.unwrap();
        let job = fixture.job(second.clone()).await;
        pool.inbound().send(job).await.unwrap();

        let started = Instant::now();
        match fixture.next_terminal().await {
            DispatchEvent::Delivered { message_id, .. } => assert_eq!(message_id, second.id),
            other => panic!("expected delivery, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(30));

        match fixture.next_terminal().await {
            DispatchEvent::Delivered { message_id, attempts, .. } => {
                assert_eq!(message_id, first.id);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_without_sending() {
        let mut fixture = Fixture::new().await;
        let store = Arc::new(InMemoryDedupStore::new(Duration::from_secs(60)));
        store.mark_delivered("order-9").await;
        fixture.context.dedup = Some(store);
        let sender = Arc::new(ScriptedSender::succeeding(Channel::Email));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let job = fixture.job(email(3).with_idempotency_key("order-9")).await;
        pool.inbound().send(job).await.unwrap();

        assert!(matches!(
            fixture.next_terminal().await,
            DispatchEvent::Duplicate { key, .. } if key == "order-9"
        ));
        assert_eq!(sender.send_count().await, 0);
        assert_eq!(fixture.broker.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_finishes_in_flight_and_requeues_rest() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(
            ScriptedSender::succeeding(Channel::Email).with_latency(Duration::from_secs(1)),
        );
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let first = email(3);
        for message in [first.clone(), email(3), email(3)] {
            let job = fixture.job(message).await;
            pool.inbound().send(job).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.shutdown.send(true).unwrap();
        pool.drain().await;

        match fixture.next_terminal().await {
            DispatchEvent::Delivered { message_id, .. } => assert_eq!(message_id, first.id),
            other => panic!("expected delivery, got {other:?}"),
        }
        assert_eq!(sender.send_count().await, 1);
        assert_eq!(fixture.broker.unacked_count(), 0);
        assert_eq!(fixture.broker.queue_depth("notifications.email"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_releases_scheduled_retries() {
        let mut fixture = Fixture::new().await;
        let sender = Arc::new(ScriptedSender::always(Channel::Email, DeliveryOutcome::transient("busy")));
        let pool = fixture.start(&ChannelConfig::new(Channel::Email, 1, 0), sender.clone());

        let job = fixture.job(email(3)).await;
        pool.inbound().send(job).await.unwrap();

        loop {
            if let DispatchEvent::RetryScheduled { .. } = fixture.events.recv().await.unwrap() {
                break;
            }
        }
        fixture.shutdown.send(true).unwrap();
        pool.drain().await;

        assert_eq!(sender.send_count().await, 1);
        assert_eq!(fixture.broker.unacked_count(), 0);
        assert_eq!(fixture.broker.queue_depth("notifications.email"), 1);
    }
}
