//! Broker connection supervision: connect with backoff, hand out the live
//! channel and redeclare the topology on every new connection.

use super::{BrokerChannel, BrokerClient, BrokerError, Topology};
use crate::error::{DispatchError, ErrorCategory};
use crate::metrics;
use crate::shutdown::sleep_or_shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Backoff applied between connection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up, 0 retries forever
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(5);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts != 0 && failures >= self.max_attempts
    }
}

/// Owns the broker channel and its topology.
///
/// The channel is opened lazily and reopened with exponential backoff
/// whenever it is found closed. Topology is declared on every new channel.
pub struct BrokerConnection {
    client: Arc<dyn BrokerClient>,
    topology: Topology,
    policy: ReconnectPolicy,
    current: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl BrokerConnection {
    pub fn new(client: Arc<dyn BrokerClient>, topology: Topology, policy: ReconnectPolicy) -> Self {
        Self {
            client,
            topology,
            policy,
            current: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The current channel if it is open. Never reconnects, and returns
    /// `None` while a reconnect is in progress.
    pub fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        let current = self.current.try_lock().ok()?;
        current.as_ref().filter(|channel| channel.is_open()).cloned()
    }

    /// Open channel, reconnecting first if the current one is gone.
    ///
    /// Fails with [`DispatchError::BrokerConnectivity`] once the reconnect
    /// budget is spent, and with [`DispatchError::Shutdown`] if shutdown is
    /// requested while waiting.
    pub async fn channel(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Arc<dyn BrokerChannel>, DispatchError> {
        let mut current = self.current.lock().await;
        if let Some(channel) = current.as_ref()
            && channel.is_open()
        {
            return Ok(channel.clone());
        }
        self.connect(&mut current, shutdown).await
    }

    async fn connect(
        &self,
        current: &mut Option<Arc<dyn BrokerChannel>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Arc<dyn BrokerChannel>, DispatchError> {
        if let Some(previous) = current.take() {
            let _ = previous.close().await;
        }

        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Err(DispatchError::Shutdown);
            }

            match self.open().await {
                Ok(channel) => {
                    if failures > 0 {
                        info!(failures, "Broker connection recovered");
                    } else {
                        info!(
                            exchange = %self.topology.exchange,
                            exchange_type = %self.topology.exchange_type,
                            dead_letter_exchange = %self.topology.dead_letter_exchange,
                            "Connected to broker and declared topology"
                        );
                    }
                    *current = Some(channel.clone());
                    return Ok(channel);
                }
                Err(e) if e.category() == ErrorCategory::Permanent => {
                    error!(error = %e, "Broker rejected topology declaration");
                    return Err(DispatchError::Broker(e));
                }
                Err(e) => {
                    failures += 1;
                    metrics::broker_reconnect_failed();

                    if self.policy.exhausted(failures) {
                        error!(
                            error = %e,
                            attempts = failures,
                            "Broker unreachable, reconnect budget exhausted"
                        );
                        return Err(DispatchError::BrokerConnectivity {
                            attempts: failures,
                            source: e,
                        });
                    }

                    let backoff = self.policy.delay(failures);
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Broker connection failed, backing off"
                    );

                    if sleep_or_shutdown(backoff, shutdown).await {
                        return Err(DispatchError::Shutdown);
                    }
                }
            }
        }
    }

    /// Close the current channel. Unacknowledged deliveries return to the broker.
    pub async fn close(&self) {
        if let Some(channel) = self.current.lock().await.take()
            && let Err(e) = channel.close().await
        {
            warn!(error = %e, "Failed to close broker channel");
        }
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.client.connect().await?;
        self.topology.declare(channel.as_ref()).await?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeType, InMemoryBroker};
    use crate::message::Channel;

    fn topology() -> Topology {
        Topology::new(
            "notifications",
            ExchangeType::Topic,
            "notifications.dlx",
            vec![Channel::Email],
        )
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_declares_topology() {
        let broker = InMemoryBroker::new();
        let connection =
            BrokerConnection::new(Arc::new(broker.clone()), topology(), ReconnectPolicy::default());
        let (_tx, mut rx) = watch::channel(false);

        let channel = connection.channel(&mut rx).await.unwrap();
        assert!(channel.is_open());

        assert_eq!(broker.exchange_type("notifications"), Some(ExchangeType::Topic));
        assert_eq!(
            broker.exchange_type("notifications.dlx"),
            Some(ExchangeType::Direct)
        );
        assert_eq!(
            broker.bindings("notifications"),
            vec![("notifications.email".to_string(), "notification.email".to_string())]
        );
        let options = broker.queue_options("notifications.email").unwrap();
        assert_eq!(options.dead_letter_exchange.as_deref(), Some("notifications.dlx"));

        // Reuses the open channel.
        connection.channel(&mut rx).await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let connection =
            BrokerConnection::new(Arc::new(broker.clone()), topology(), ReconnectPolicy::new(3));
        let (_tx, mut rx) = watch::channel(false);

        let err = match connection.channel(&mut rx).await {
            Err(e) => e,
            Ok(_) => panic!("offline broker must not connect"),
        };
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            DispatchError::BrokerConnectivity { attempts: 3, .. }
        ));
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_when_broker_returns() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            topology(),
            ReconnectPolicy::new(0),
        ));
        let (_tx, mut rx) = watch::channel(false);

        let task = tokio::spawn({
            let connection = connection.clone();
            async move { connection.channel(&mut rx).await.is_ok() }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        broker.set_online(true);

        assert!(task.await.unwrap());
        assert!(broker.connect_attempts() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker),
            topology(),
            ReconnectPolicy::new(0),
        ));
        let (tx, mut rx) = watch::channel(false);

        let task = tokio::spawn({
            let connection = connection.clone();
            async move { connection.channel(&mut rx).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();

        assert!(matches!(task.await.unwrap(), Err(DispatchError::Shutdown)));
    }
}
