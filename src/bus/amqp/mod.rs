//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection and one channel per consumer instance. Exchanges are
//! durable topic exchanges; the queue is durable and consumed with auto-ack.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::info;

use super::{Broker, BusError, DeliveryStream, Result};
use crate::events::{EventEnvelope, TopicBinding};

/// RabbitMQ broker channel owned by a single consumer.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Connect and open a channel.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        info!("Connected to AMQP");

        Ok(Self {
            connection,
            channel,
        })
    }
}

fn envelope_from_delivery(mut delivery: Delivery) -> EventEnvelope {
    let body = std::mem::take(&mut delivery.data);
    let mut envelope = EventEnvelope::new(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        body,
    )
    .with_delivery_tag(delivery.delivery_tag);
    envelope.redelivered = delivery.redelivered;
    envelope
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Declare(format!("Failed to declare queue: {}", e)))
    }

    async fn bind_queue(&self, queue: &str, binding: &TopicBinding) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to bind queue: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(envelope_from_delivery)
                .map_err(|e| BusError::ConsumerLost(e.to_string()))
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "relay shutting down")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}
