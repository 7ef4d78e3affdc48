//! Routes decoded domain events to push hub broadcasts.
//!
//! Each routing key maps to one hub channel, one client method and a fixed
//! positional argument list taken from the event. Keys without a route are
//! ignored.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, Instrument};

use crate::bus::{BusError, EventHandler, Result};
use crate::events::{exchanges, routing_keys, DomainEvent};
use crate::hub::{BroadcastReport, Broadcaster};

/// How one routing key is forwarded.
#[derive(Clone, Copy)]
pub struct Route {
    pub routing_key: &'static str,
    pub channel: &'static str,
    pub method: &'static str,
    /// `None` when handed an event of another kind.
    pub arguments: fn(&DomainEvent) -> Option<Vec<Value>>,
}

const ROUTES: &[Route] = &[
    Route {
        routing_key: routing_keys::PRODUCT_CREATED,
        channel: exchanges::PRODUCT,
        method: "ProductCreated",
        arguments: |event| match event {
            DomainEvent::ProductCreated(e) => Some(vec![json!(e.product_id), json!(e.name)]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::PRODUCT_UPDATED,
        channel: exchanges::PRODUCT,
        method: "ProductUpdated",
        arguments: |event| match event {
            DomainEvent::ProductUpdated(e) => Some(vec![json!(e.product_id), json!(e.name)]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::PRODUCT_DELETED,
        channel: exchanges::PRODUCT,
        method: "ProductDeleted",
        arguments: |event| match event {
            DomainEvent::ProductDeleted(e) => Some(vec![json!(e.product_id)]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::INVENTORY_UPDATED,
        channel: exchanges::INVENTORY,
        method: "InventoryUpdated",
        arguments: |event| match event {
            DomainEvent::InventoryUpdated(e) => Some(vec![
                json!(e.inventory_id),
                json!(e.product_id),
                json!(e.quantity),
            ]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::INVENTORY_TRANSACTION_CREATED,
        channel: exchanges::INVENTORY,
        method: "InventoryTransactionCreated",
        arguments: |event| match event {
            DomainEvent::InventoryTransactionCreated(e) => Some(vec![
                json!(e.transaction_id),
                json!(e.inventory_id),
                json!(e.product_id),
                json!(e.transaction_type.as_str()),
                json!(e.quantity),
            ]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::ORDER_CREATED,
        channel: exchanges::ORDER,
        method: "OrderCreated",
        arguments: |event| match event {
            DomainEvent::OrderCreated(e) => Some(vec![json!(e.order_id), json!(e.customer_name)]),
            _ => None,
        },
    },
    Route {
        routing_key: routing_keys::ORDER_STATUS_CHANGED,
        channel: exchanges::ORDER,
        method: "OrderStatusChanged",
        arguments: |event| match event {
            DomainEvent::OrderStatusChanged(e) => {
                Some(vec![json!(e.order_id), json!(e.new_status.as_str())])
            }
            _ => None,
        },
    },
];

impl Route {
    /// Look up the route for a routing key.
    pub fn find(routing_key: &str) -> Option<&'static Route> {
        ROUTES.iter().find(|route| route.routing_key == routing_key)
    }

    /// Every route, in table order.
    pub fn all() -> &'static [Route] {
        ROUTES
    }
}

/// Forwards decoded events to a [`Broadcaster`].
#[derive(Clone)]
pub struct EventForwarder {
    broadcaster: Arc<dyn Broadcaster>,
}

impl EventForwarder {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { broadcaster }
    }

    /// Broadcast one event.
    ///
    /// Returns `Ok(None)` when the routing key has no route.
    pub async fn forward(&self, event: &DomainEvent) -> Result<Option<BroadcastReport>> {
        let routing_key = event.routing_key();
        let Some(route) = Route::find(routing_key) else {
            debug!(routing_key = %routing_key, "No route for event, ignoring");
            return Ok(None);
        };

        let arguments = (route.arguments)(event).ok_or_else(|| {
            BusError::Handler(format!(
                "event does not match route for '{}'",
                route.routing_key
            ))
        })?;

        let report = self
            .broadcaster
            .broadcast(route.channel, route.method, arguments)
            .await;

        debug!(
            routing_key = %routing_key,
            channel = %route.channel,
            method = %route.method,
            delivered = report.delivered,
            failed = report.failed,
            "Event forwarded"
        );

        Ok(Some(report))
    }
}

impl EventHandler for EventForwarder {
    fn handle(&self, event: Arc<DomainEvent>) -> BoxFuture<'static, Result<()>> {
        let forwarder = self.clone();
        let span = tracing::debug_span!("forwarder.handle", routing_key = %event.routing_key());

        Box::pin(
            async move {
                forwarder.forward(&event).await?;
                Ok(())
            }
            .instrument(span),
        )
    }
}
