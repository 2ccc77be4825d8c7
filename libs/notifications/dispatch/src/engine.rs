//! Engine wiring
//!
//! [`NotificationEngine`] builds one worker pool per runnable channel, a
//! dispatcher feeding them from the broker and a dead-letter router with its
//! queue monitor, then runs until shutdown or a fatal broker error.

use crate::broker::{BrokerClient, BrokerConnection};
use crate::config::{ChannelConfig, NotificationConfig};
use crate::dedup::{DedupStore, InMemoryDedupStore};
use crate::dispatcher::{Dispatcher, Route};
use crate::dlq::{DeadLetterMonitor, DeadLetterRouter};
use crate::error::DispatchError;
use crate::event::{DispatchEvent, EventBus};
use crate::publisher::NotificationPublisher;
use crate::retry::RetryPolicy;
use crate::sender::SenderMap;
use crate::worker_pool::{PoolContext, WorkerPool};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

pub struct NotificationEngine {
    connection: Arc<BrokerConnection>,
    channels: Vec<ChannelConfig>,
    senders: SenderMap,
    retry_policy: RetryPolicy,
    prefetch: u16,
    events: EventBus,
    dead_letters: Arc<DeadLetterRouter>,
    dead_letter_monitor: Option<DeadLetterMonitor>,
    dedup: Option<Arc<dyn DedupStore>>,
}

impl NotificationEngine {
    /// Validate `config` and prepare the engine. Nothing touches the broker
    /// until [`run`](Self::run).
    ///
    /// A channel runs when it is enabled, has at least one worker and has a
    /// sender in `senders`. Other channels keep their queue but get no pool,
    /// so their messages are rejected to the dead-letter exchange.
    pub fn new(
        config: &NotificationConfig,
        client: Arc<dyn BrokerClient>,
        senders: SenderMap,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let mut channels = Vec::new();
        for channel in config.channels() {
            if !channel.enabled {
                info!(channel = %channel.channel, "Channel disabled");
            } else if channel.concurrency == 0 {
                warn!(channel = %channel.channel, "Channel enabled with zero concurrency, not consuming");
            } else if !senders.contains_key(&channel.channel) {
                warn!(channel = %channel.channel, "No sender configured, not consuming");
            } else {
                channels.push(channel);
            }
        }

        let connection = Arc::new(BrokerConnection::new(
            client,
            config.topology(),
            config.reconnect_policy(),
        ));
        let events = EventBus::new();
        let dead_letters = Arc::new(
            DeadLetterRouter::new(connection.clone(), events.clone())
                .with_publish_attempts(config.dispatch.dead_letter_publish_attempts()),
        );
        let dedup = config
            .dispatch
            .dedup_window()
            .map(|window| Arc::new(InMemoryDedupStore::new(window)) as Arc<dyn DedupStore>);

        Ok(Self {
            connection,
            channels,
            senders,
            retry_policy: config.retry_policy(),
            prefetch: config.prefetch(),
            events,
            dead_letters,
            dead_letter_monitor: config.dispatch.dead_letter_monitor(),
            dedup,
        })
    }

    /// Replace the dedup store (enabled even if the config window is 0).
    pub fn with_dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Replace the dead-letter monitor settings, `None` disables it.
    pub fn with_dead_letter_monitor(mut self, monitor: Option<DeadLetterMonitor>) -> Self {
        self.dead_letter_monitor = monitor;
        self
    }

    /// Channels with a running worker pool
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> Arc<BrokerConnection> {
        self.connection.clone()
    }

    /// Publisher sharing the engine's broker connection
    pub fn publisher(&self) -> NotificationPublisher {
        NotificationPublisher::new(self.connection.clone())
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterRouter> {
        self.dead_letters.clone()
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// On shutdown the dispatcher stops taking deliveries, workers finish the
    /// send they are in, and every job not yet settled is handed back to the
    /// broker before the channel is closed. Returns an error only when the
    /// broker stays unreachable past the reconnect budget.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let context = PoolContext {
            retry_policy: self.retry_policy,
            dead_letters: self.dead_letters.clone(),
            events: self.events.clone(),
            dedup: self.dedup.clone(),
        };

        let mut dispatcher =
            Dispatcher::new(self.connection.clone(), self.events.clone()).with_prefetch(self.prefetch);
        let mut pools = Vec::with_capacity(self.channels.len());
        for config in &self.channels {
            let Some(sender) = self.senders.get(&config.channel) else {
                continue;
            };
            let pool = WorkerPool::start(config, sender.clone(), context.clone(), stop_rx.clone());
            dispatcher = dispatcher.with_route(
                config.channel,
                Route {
                    inbound: pool.inbound(),
                    default_max_retries: config.max_retries,
                },
            );
            pools.push(pool);
        }

        let monitor = self.dead_letter_monitor.clone().map(|settings| {
            let dead_letters = self.dead_letters.clone();
            let shutdown = stop_rx.clone();
            tokio::spawn(async move { dead_letters.monitor(settings, shutdown).await })
        });

        info!(
            channels = ?self.channels.iter().map(|c| c.channel.as_str()).collect::<Vec<_>>(),
            base_retry_delay_ms = self.retry_policy.base_delay().as_millis() as u64,
            max_retry_delay_ms = self.retry_policy.max_delay().as_millis() as u64,
            dedup = self.dedup.is_some(),
            "Notification engine started"
        );

        let result = dispatcher.run(shutdown).await;
        match &result {
            Ok(()) => info!("Draining worker pools"),
            Err(e) => error!(error = %e, "Dispatcher failed, draining worker pools"),
        }

        let _ = stop_tx.send(true);
        drop(dispatcher);
        for pool in pools {
            pool.drain().await;
        }
        if let Some(monitor) = monitor
            && let Err(e) = monitor.await
        {
            error!(error = %e, "Dead-letter monitor panicked");
        }
        self.connection.close().await;

        info!("Notification engine stopped");
        result
    }
}
