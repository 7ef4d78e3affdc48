//! Broker-facing side of the relay.
//!
//! This module contains:
//! - `Broker` trait: the topology and consume operations a broker channel offers
//! - `EventHandler` trait: the dispatch callback invoked per decoded event
//! - `BrokerConsumer`: declares topology and runs the receive loop
//! - Implementations: AMQP (RabbitMQ), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::events::{DomainEvent, EventEnvelope, TopicBinding};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
mod consumer;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use consumer::{BrokerConsumer, ConsumerConfig};
pub use mock::MockBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Consumer lost: {0}")]
    ConsumerLost(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Stream of raw deliveries from a consumed queue.
///
/// An `Err` item or the end of the stream means the broker channel is gone.
pub type DeliveryStream = BoxStream<'static, Result<EventEnvelope>>;

/// Handler for decoded events taken off the bus.
pub trait EventHandler: Send + Sync {
    /// Process one event. Called in delivery order, one at a time.
    fn handle(&self, event: Arc<DomainEvent>) -> BoxFuture<'static, Result<()>>;
}

/// Operations the consumer needs from a broker channel.
///
/// Declarations must be idempotent: declaring an existing exchange or queue,
/// or re-binding an existing binding, is a no-op.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Bind a queue to an exchange by routing key.
    async fn bind_queue(&self, queue: &str, binding: &TopicBinding) -> Result<()>;

    /// Start consuming a queue with automatic acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
