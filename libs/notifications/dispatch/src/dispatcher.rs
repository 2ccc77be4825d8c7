//! Broker consumer loop
//!
//! Consumes every channel queue of the topology, decodes deliveries and
//! hands them to the worker pool of their channel. Deliveries that cannot be
//! dispatched are rejected without requeue, which sends them to the queue's
//! dead-letter exchange.
//!
//! Backpressure: a delivery is only taken off the stream once the previous
//! one found room in its pool's queue, so a saturated pool stops the loop and
//! the broker's prefetch window fills up instead of process memory.

use crate::broker::{BrokerConnection, Delivery, DeliveryStream};
use crate::error::DispatchError;
use crate::event::{DispatchEvent, EventBus};
use crate::message::{Channel, DecodeError, NotificationMessage};
use crate::metrics;
use crate::shutdown;
use crate::worker_pool::DeliveryJob;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Inbound queue of one channel plus the retry budget used for messages
/// that do not carry their own
#[derive(Clone)]
pub struct Route {
    pub inbound: mpsc::Sender<DeliveryJob>,
    pub default_max_retries: u32,
}

pub struct Dispatcher {
    connection: Arc<BrokerConnection>,
    routes: HashMap<Channel, Route>,
    events: EventBus,
    prefetch: u16,
}

impl Dispatcher {
    pub fn new(connection: Arc<BrokerConnection>, events: EventBus) -> Self {
        Self {
            connection,
            routes: HashMap::new(),
            events,
            prefetch: 0,
        }
    }

    /// Unacknowledged deliveries per consumer, 0 for unbounded
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Dispatch `channel` messages to `route`. Channels without a route are
    /// rejected.
    pub fn with_route(mut self, channel: Channel, route: Route) -> Self {
        self.routes.insert(channel, route);
        self
    }

    /// Consume until shutdown.
    ///
    /// Lost connections are re-established through the [`BrokerConnection`];
    /// returns an error only when that gives up.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let queues = self.connection.topology().consume_queues();
        if queues.is_empty() {
            warn!("No channel queues to consume, dispatcher idle until shutdown");
            shutdown::requested(&mut shutdown).await;
            return Ok(());
        }

        info!(queues = ?queues, prefetch = self.prefetch, "Starting dispatcher");

        loop {
            let mut deliveries = match self.subscribe(&queues, &mut shutdown).await {
                Ok(deliveries) => deliveries,
                Err(DispatchError::Shutdown) => break,
                Err(e) => return Err(e),
            };

            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = shutdown::requested(&mut shutdown) => {
                        info!("Received shutdown signal, stopping dispatcher");
                        return Ok(());
                    }
                    delivery = deliveries.next() => delivery,
                };

                match delivery {
                    Some(delivery) => {
                        if !self.dispatch(delivery, &mut shutdown).await {
                            return Ok(());
                        }
                    }
                    None => break,
                }
            }

            warn!("Broker consumer stream ended, reconnecting");
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Open consumers on every queue, reconnecting as needed.
    async fn subscribe(
        &self,
        queues: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DeliveryStream, DispatchError> {
        let mut channel = self.connection.channel(shutdown).await?;

        loop {
            let mut streams = Vec::with_capacity(queues.len());
            let mut failure = None;
            for queue in queues {
                match channel.consume(queue, self.prefetch).await {
                    Ok(stream) => streams.push(stream),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                None => return Ok(stream::select_all(streams).boxed()),
                Some(e) if e.is_connection_error() => {
                    warn!(error = %e, "Consumer setup lost the channel, reconnecting");
                    channel = self.connection.channel(shutdown).await?;
                }
                Some(e) => return Err(e.into()),
            }
        }
    }

    /// Route one delivery. Returns `false` if shutdown interrupted it.
    async fn dispatch(&self, delivery: Delivery, shutdown: &mut watch::Receiver<bool>) -> bool {
        metrics::message_received();

        let decoded = NotificationMessage::decode(&delivery.body, |channel| {
            self.routes
                .get(&channel)
                .map(|route| route.default_max_retries)
                .unwrap_or_default()
        });

        let message = match decoded {
            Ok(message) => message,
            Err(DecodeError::UnknownChannel(channel)) => {
                self.reject(delivery, None, Some(channel), "unknown_channel", "unknown channel")
                    .await;
                return true;
            }
            Err(DecodeError::Malformed(details)) => {
                let reason = format!("malformed message: {details}");
                self.reject(delivery, None, None, "malformed", &reason).await;
                return true;
            }
        };

        let Some(route) = self.routes.get(&message.channel) else {
            self.reject(
                delivery,
                Some(message.id),
                Some(message.channel.to_string()),
                "channel_disabled",
                "channel disabled",
            )
            .await;
            return true;
        };

        debug!(
            message_id = %message.id,
            channel = %message.channel,
            attempt = message.attempt,
            redelivered = delivery.redelivered,
            "Dispatching message"
        );
        self.events.emit(DispatchEvent::Received {
            message_id: message.id.clone(),
            channel: message.channel,
        });

        let job = DeliveryJob::new(message, delivery.ack).with_redelivered(delivery.redelivered);
        tokio::select! {
            biased;
            _ = shutdown::requested(shutdown) => {
                job.release().await;
                false
            }
            permit = route.inbound.reserve() => {
                match permit {
                    Ok(permit) => permit.send(job),
                    Err(_) => {
                        warn!(message_id = %job.message.id, "Worker pool stopped, requeueing");
                        job.release().await;
                    }
                }
                true
            }
        }
    }

    async fn reject(
        &self,
        delivery: Delivery,
        message_id: Option<String>,
        channel: Option<String>,
        label: &'static str,
        reason: &str,
    ) {
        warn!(
            message_id = message_id.as_deref().unwrap_or("-"),
            channel = channel.as_deref().unwrap_or("-"),
            routing_key = %delivery.routing_key,
            reason = %reason,
            "Rejecting message without requeue"
        );
        metrics::message_rejected(label);

        if let Err(e) = delivery.ack.nack(false).await {
            warn!(error = %e, "Failed to reject delivery");
        }

        self.events.emit(DispatchEvent::Rejected {
            message_id,
            channel,
            reason: reason.to_string(),
        });
    }
}
