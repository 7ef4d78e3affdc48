//! event-relay: broker-to-push-hub relay
//!
//! Consumes domain events from RabbitMQ and broadcasts them to live clients
//! connected over WebSocket. Also keeps supervised connections open to each
//! domain service's own push hub.
//!
//! ## Architecture
//! ```text
//! [domain services] -> [topic exchanges] -> [event-relay] -> /hubs/{channel} -> [live clients]
//!                                                |
//!                                                +--(supervised)--> [domain push hubs]
//! ```
//!
//! ## Configuration
//! - RELAY_CONFIG: path to a YAML config file (default: ./config.yaml)
//! - RELAY__SECTION__KEY: overrides, e.g. RELAY__BROKER__HOST=rabbitmq
//! - RELAY_LOG: tracing filter (default: info)
//! - RELAY_LOG_FORMAT=json: JSON log lines

use std::sync::Arc;

use tracing::{debug, error, info};

use event_relay::bus::{AmqpBroker, BrokerConsumer};
use event_relay::config::Config;
use event_relay::handlers::{EventForwarder, Route};
use event_relay::hub::{HubConnector, HubRegistry, HubServer};
use event_relay::supervisor::Supervisor;
use event_relay::utils::bootstrap::init_tracing;
use event_relay::utils::shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        queue = %config.broker.queue,
        bindings = config.broker.bindings.len(),
        hub_port = config.hub.port,
        targets = config.supervisor.targets.len(),
        "Starting event-relay"
    );

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let registry = Arc::new(HubRegistry::new(config.hub.send_timeout()));

    let server = HubServer::bind(config.hub.clone(), Arc::clone(&registry)).await?;
    let server_task = tokio::spawn(server.run(shutdown_rx.clone()));

    let broker = AmqpBroker::connect(&config.broker.url()).await.map_err(|e| {
        error!(host = %config.broker.host, "Failed to connect to broker: {}", e);
        e
    })?;
    for route in Route::all() {
        debug!(
            routing_key = route.routing_key,
            channel = route.channel,
            method = route.method,
            "Forwarding route"
        );
    }
    let forwarder = Arc::new(EventForwarder::new(registry.clone()));
    let mut consumer_task = tokio::spawn(
        BrokerConsumer::new(broker, config.broker.consumer()).run(forwarder, shutdown_rx.clone()),
    );

    let mut connector = HubConnector::new(shutdown_rx.clone());
    if config.supervisor.relay_invocations {
        connector = connector.with_relay(registry.clone());
    }
    let supervision = Supervisor::new(config.supervisor.retry, shutdown_rx)
        .supervise(config.supervisor.targets.clone(), Arc::new(connector));

    let mut consumer_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        result = &mut consumer_task => {
            consumer_result = Some(result);
        }
    }

    let _ = shutdown_tx.send(true);

    let consumer_result = match consumer_result {
        Some(result) => result,
        None => consumer_task.await,
    };

    for (target, state) in supervision.join().await {
        info!(target = %target, state = %state, "Push hub supervision stopped");
    }

    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "Push hub server failed"),
        Err(e) => error!(error = %e, "Push hub server task panicked"),
        Ok(Ok(())) => {}
    }

    match consumer_result {
        Ok(Ok(())) => {
            info!("event-relay stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Broker consumer failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Broker consumer task panicked");
            Err(e.into())
        }
    }
}
