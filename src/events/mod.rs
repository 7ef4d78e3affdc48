//! Event envelope, topic bindings and typed domain events.
//!
//! Domain services publish UTF-8 JSON bodies onto per-domain topic exchanges.
//! The relay receives them as [`EventEnvelope`]s and decodes each body by its
//! routing key into a [`DomainEvent`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic exchange names, one per publishing domain.
pub mod exchanges {
    pub const PRODUCT: &str = "product";
    pub const INVENTORY: &str = "inventory";
    pub const ORDER: &str = "order";
}

/// Routing keys published by the domain services.
pub mod routing_keys {
    pub const PRODUCT_CREATED: &str = "product.created";
    pub const PRODUCT_UPDATED: &str = "product.updated";
    pub const PRODUCT_DELETED: &str = "product.deleted";
    pub const INVENTORY_UPDATED: &str = "inventory.updated";
    pub const INVENTORY_TRANSACTION_CREATED: &str = "inventory.transaction.created";
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_STATUS_CHANGED: &str = "order.status.changed";
}

/// Errors raised while decoding an envelope body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed '{routing_key}' event body: {source}")]
    Malformed {
        routing_key: String,
        source: serde_json::Error,
    },
}

// ============================================================================
// Topic Model
// ============================================================================

/// An (exchange, routing key pattern) pair a queue is bound with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicBinding {
    /// Topic exchange name.
    pub exchange: String,
    /// Routing key or pattern (`*` = one word, `#` = zero or more words).
    pub routing_key: String,
}

impl TopicBinding {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Whether a published routing key would be delivered through this binding.
    pub fn matches(&self, routing_key: &str) -> bool {
        topic_matches(&self.routing_key, routing_key)
    }
}

impl fmt::Display for TopicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.routing_key)
    }
}

/// Bindings the relay subscribes to out of the box.
pub fn default_bindings() -> Vec<TopicBinding> {
    vec![
        TopicBinding::new(exchanges::PRODUCT, routing_keys::PRODUCT_CREATED),
        TopicBinding::new(exchanges::PRODUCT, routing_keys::PRODUCT_UPDATED),
        TopicBinding::new(exchanges::INVENTORY, routing_keys::INVENTORY_UPDATED),
        TopicBinding::new(
            exchanges::INVENTORY,
            routing_keys::INVENTORY_TRANSACTION_CREATED,
        ),
        TopicBinding::new(exchanges::ORDER, routing_keys::ORDER_CREATED),
        TopicBinding::new(exchanges::ORDER, routing_keys::ORDER_STATUS_CHANGED),
    ]
}

/// Topic exchange matching over dot-separated words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
        _ => false,
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A raw message as delivered by the broker.
///
/// Deliveries are auto-acknowledged, so the delivery tag is informational.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            delivery_tag: 0,
            redelivered: false,
            received_at: Utc::now(),
        }
    }

    pub fn with_delivery_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = delivery_tag;
        self
    }

    /// Decode the body according to the routing key.
    pub fn decode(&self) -> Result<DomainEvent, DecodeError> {
        DomainEvent::decode(&self.routing_key, &self.body)
    }
}

// ============================================================================
// Typed Events
// ============================================================================

/// Inventory movement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Inbound,
    Outbound,
    Adjustment,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "Inbound",
            Self::Outbound => "Outbound",
            Self::Adjustment => "Adjustment",
            Self::Transfer => "Transfer",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Processing => "Processing",
            Self::Shipped => "Shipped",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCreated {
    pub product_id: i64,
    #[serde(alias = "productName")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdated {
    pub product_id: i64,
    #[serde(alias = "productName")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDeleted {
    pub product_id: i64,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdated {
    pub inventory_id: i64,
    pub product_id: i64,
    pub location_id: i64,
    pub quantity: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryTransactionCreated {
    pub transaction_id: i64,
    pub inventory_id: i64,
    pub product_id: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub quantity: i32,
    #[serde(default)]
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: i64,
    pub customer_name: String,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChanged {
    pub order_id: i64,
    #[serde(default)]
    pub old_status: Option<OrderStatus>,
    #[serde(alias = "status")]
    pub new_status: OrderStatus,
    pub changed_at: DateTime<Utc>,
}

/// A decoded domain event, keyed by the routing key it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    ProductCreated(ProductCreated),
    ProductUpdated(ProductUpdated),
    ProductDeleted(ProductDeleted),
    InventoryUpdated(InventoryUpdated),
    InventoryTransactionCreated(InventoryTransactionCreated),
    OrderCreated(OrderCreated),
    OrderStatusChanged(OrderStatusChanged),
    /// Well-formed JSON on a routing key without a typed decoder.
    Unrecognized { routing_key: String, payload: Value },
}

type Decoder = fn(&[u8]) -> serde_json::Result<DomainEvent>;

fn parse<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(body)
}

/// Routing key -> typed decoder.
const DECODERS: &[(&str, Decoder)] = &[
    (routing_keys::PRODUCT_CREATED, |body: &[u8]| {
        parse(body).map(DomainEvent::ProductCreated)
    }),
    (routing_keys::PRODUCT_UPDATED, |body: &[u8]| {
        parse(body).map(DomainEvent::ProductUpdated)
    }),
    (routing_keys::PRODUCT_DELETED, |body: &[u8]| {
        parse(body).map(DomainEvent::ProductDeleted)
    }),
    (routing_keys::INVENTORY_UPDATED, |body: &[u8]| {
        parse(body).map(DomainEvent::InventoryUpdated)
    }),
    (routing_keys::INVENTORY_TRANSACTION_CREATED, |body: &[u8]| {
        parse(body).map(DomainEvent::InventoryTransactionCreated)
    }),
    (routing_keys::ORDER_CREATED, |body: &[u8]| {
        parse(body).map(DomainEvent::OrderCreated)
    }),
    (routing_keys::ORDER_STATUS_CHANGED, |body: &[u8]| {
        parse(body).map(DomainEvent::OrderStatusChanged)
    }),
];

impl DomainEvent {
    /// Decode a message body by routing key.
    ///
    /// Keys without a typed decoder still decode, as [`DomainEvent::Unrecognized`],
    /// provided the body is valid JSON.
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let decoded = match DECODERS.iter().find(|(key, _)| *key == routing_key) {
            Some((_, decoder)) => decoder(body),
            None => parse(body).map(|payload| DomainEvent::Unrecognized {
                routing_key: routing_key.to_string(),
                payload,
            }),
        };

        decoded.map_err(|source| DecodeError::Malformed {
            routing_key: routing_key.to_string(),
            source,
        })
    }

    /// Whether a typed decoder exists for this routing key.
    pub fn is_known(routing_key: &str) -> bool {
        DECODERS.iter().any(|(key, _)| *key == routing_key)
    }

    pub fn routing_key(&self) -> &str {
        match self {
            Self::ProductCreated(_) => routing_keys::PRODUCT_CREATED,
            Self::ProductUpdated(_) => routing_keys::PRODUCT_UPDATED,
            Self::ProductDeleted(_) => routing_keys::PRODUCT_DELETED,
            Self::InventoryUpdated(_) => routing_keys::INVENTORY_UPDATED,
            Self::InventoryTransactionCreated(_) => routing_keys::INVENTORY_TRANSACTION_CREATED,
            Self::OrderCreated(_) => routing_keys::ORDER_CREATED,
            Self::OrderStatusChanged(_) => routing_keys::ORDER_STATUS_CHANGED,
            Self::Unrecognized { routing_key, .. } => routing_key,
        }
    }
}
