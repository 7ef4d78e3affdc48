//! In-memory broker for tests and local runs without RabbitMQ.
//!
//! Models topic routing: a published message reaches the consumed queue only
//! when one of the queue's bindings matches its exchange and routing key.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};

use super::{Broker, BusError, DeliveryStream, Result};
use crate::events::{EventEnvelope, TopicBinding};

type DeliverySender = mpsc::UnboundedSender<Result<EventEnvelope>>;
type DeliveryReceiver = mpsc::UnboundedReceiver<Result<EventEnvelope>>;

#[derive(Default)]
struct MockState {
    exchanges: BTreeSet<String>,
    queues: BTreeSet<String>,
    bindings: BTreeSet<(String, TopicBinding)>,
    bind_calls: usize,
    fail_on_declare: bool,
    consuming: bool,
    next_delivery_tag: u64,
    sender: Option<DeliverySender>,
    receiver: Option<DeliveryReceiver>,
}

/// Mock broker. Clones share state, so a test keeps one handle while the
/// consumer owns another.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<RwLock<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(RwLock::new(MockState {
                sender: Some(sender),
                receiver: Some(receiver),
                ..Default::default()
            })),
        }
    }

    pub async fn set_fail_on_declare(&self, fail: bool) {
        self.state.write().await.fail_on_declare = fail;
    }

    pub async fn exchanges(&self) -> Vec<String> {
        self.state.read().await.exchanges.iter().cloned().collect()
    }

    pub async fn queues(&self) -> Vec<String> {
        self.state.read().await.queues.iter().cloned().collect()
    }

    pub async fn bindings(&self) -> Vec<(String, TopicBinding)> {
        self.state.read().await.bindings.iter().cloned().collect()
    }

    /// Number of bind requests received, including repeats.
    pub async fn bind_calls(&self) -> usize {
        self.state.read().await.bind_calls
    }

    /// Wait until a consumer has started on this broker.
    pub async fn wait_for_consumer(&self) {
        while !self.state.read().await.consuming {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Publish a message. Returns whether any binding routed it.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> bool {
        let mut state = self.state.write().await;
        let routed = state
            .bindings
            .iter()
            .any(|(_, b)| b.exchange == exchange && b.matches(routing_key));
        if !routed {
            return false;
        }

        state.next_delivery_tag += 1;
        let envelope = EventEnvelope::new(exchange, routing_key, body)
            .with_delivery_tag(state.next_delivery_tag);

        match &state.sender {
            Some(sender) => sender.send(Ok(envelope)).is_ok(),
            None => false,
        }
    }

    /// Push a channel-level failure into the delivery stream.
    pub async fn fail_stream(&self, reason: &str) {
        if let Some(sender) = &self.state.read().await.sender {
            let _ = sender.send(Err(BusError::ConsumerLost(reason.to_string())));
        }
    }

    /// Drop the connection, ending the delivery stream.
    pub async fn disconnect(&self) {
        self.state.write().await.sender = None;
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_declare {
            return Err(BusError::Declare("Mock declare failure".to_string()));
        }
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_declare {
            return Err(BusError::Declare("Mock declare failure".to_string()));
        }
        state.queues.insert(queue.to_string());
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, binding: &TopicBinding) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.queues.contains(queue) {
            return Err(BusError::Declare(format!("Queue '{}' not declared", queue)));
        }
        if !state.exchanges.contains(&binding.exchange) {
            return Err(BusError::Declare(format!(
                "Exchange '{}' not declared",
                binding.exchange
            )));
        }
        state.bind_calls += 1;
        state.bindings.insert((queue.to_string(), binding.clone()));
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.state.write().await;
        if !state.queues.contains(queue) {
            return Err(BusError::Subscribe(format!("Queue '{}' not declared", queue)));
        }
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| BusError::Subscribe("Queue already has a consumer".to_string()))?;
        state.consuming = true;

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
