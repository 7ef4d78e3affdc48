//! Broker consumer: topology declaration and the receive loop.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::{Broker, BusError, EventHandler, Result};
use crate::events::{default_bindings, DomainEvent, EventEnvelope, TopicBinding};
use crate::utils::shutdown::cancelled;

/// Default durable queue name for a relay instance.
pub const DEFAULT_QUEUE: &str = "event-relay";
/// Default consumer tag.
pub const DEFAULT_CONSUMER_TAG: &str = "event-relay-consumer";

/// Queue and binding configuration for one consumer instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Durable queue owned by this consumer.
    pub queue: String,
    /// Consumer tag reported to the broker.
    pub consumer_tag: String,
    /// Exchange/routing key pairs the queue is bound with.
    pub bindings: Vec<TopicBinding>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            bindings: default_bindings(),
        }
    }
}

/// Consumes one durable queue and dispatches decoded events to a handler.
///
/// Owns its broker channel exclusively. A lost channel ends [`run`](Self::run)
/// with an error; restarting is left to the caller.
pub struct BrokerConsumer<B> {
    broker: B,
    config: ConsumerConfig,
}

impl<B: Broker> BrokerConsumer<B> {
    pub fn new(broker: B, config: ConsumerConfig) -> Self {
        Self { broker, config }
    }

    /// Declare exchanges, the queue, and every binding.
    ///
    /// Duplicate bindings in the configuration are collapsed; calling this
    /// again against the same broker is a no-op. Exact keys without a typed
    /// decoder are still bound, with a warning.
    pub async fn declare_topology(&self) -> Result<()> {
        let bindings: BTreeSet<&TopicBinding> = self.config.bindings.iter().collect();
        let exchanges: BTreeSet<&str> = bindings.iter().map(|b| b.exchange.as_str()).collect();

        for exchange in exchanges {
            self.broker.declare_exchange(exchange).await?;
            debug!(exchange = %exchange, "Declared topic exchange");
        }

        self.broker.declare_queue(&self.config.queue).await?;

        for binding in bindings {
            let exact = !binding.routing_key.contains(['*', '#']);
            if exact && !DomainEvent::is_known(&binding.routing_key) {
                warn!(
                    exchange = %binding.exchange,
                    routing_key = %binding.routing_key,
                    "No decoder for bound routing key, its events will be skipped"
                );
            }
            self.broker.bind_queue(&self.config.queue, binding).await?;
            info!(
                queue = %self.config.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Bound queue to exchange"
            );
        }

        Ok(())
    }

    /// Declare topology, then dispatch deliveries until cancelled.
    ///
    /// Returns `Ok(())` on cancellation and [`BusError::ConsumerLost`] when the
    /// delivery stream fails or ends.
    pub async fn run(
        self,
        handler: Arc<dyn EventHandler>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        self.declare_topology().await?;

        let mut deliveries = self
            .broker
            .consume(&self.config.queue, &self.config.consumer_tag)
            .await?;

        info!(
            queue = %self.config.queue,
            bindings = self.config.bindings.len(),
            "Consumer connected, processing messages"
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!(queue = %self.config.queue, "Consumer cancelled");
                    break Ok(());
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(envelope)) => process_delivery(envelope, handler.as_ref()).await,
                    Some(Err(e)) => {
                        error!(error = %e, queue = %self.config.queue, "Consumer delivery error");
                        break Err(BusError::ConsumerLost(e.to_string()));
                    }
                    None => {
                        error!(queue = %self.config.queue, "Consumer stream ended");
                        break Err(BusError::ConsumerLost("delivery stream ended".to_string()));
                    }
                }
            }
        };

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }

        result
    }
}

/// Decode and dispatch a single delivery. Never fails the loop.
async fn process_delivery(envelope: EventEnvelope, handler: &dyn EventHandler) {
    let event = match envelope.decode() {
        Ok(event) => event,
        Err(e) => {
            warn!(
                error = %e,
                routing_key = %envelope.routing_key,
                delivery_tag = envelope.delivery_tag,
                "Discarding undecodable event"
            );
            return;
        }
    };

    debug!(
        routing_key = %envelope.routing_key,
        delivery_tag = envelope.delivery_tag,
        redelivered = envelope.redelivered,
        "Received event"
    );

    let span = tracing::info_span!("bus.consume", routing_key = %envelope.routing_key);
    if let Err(e) = handler.handle(Arc::new(event)).instrument(span).await {
        error!(error = %e, routing_key = %envelope.routing_key, "Handler failed");
    }
}
