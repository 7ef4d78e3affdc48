//! Push hub: live client registry and fan-out broadcast.
//!
//! Clients connect to a channel (one per domain: `product`, `inventory`,
//! `order`). A broadcast invokes a named method with positional arguments on
//! every client registered on the channel at that moment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub mod client;
pub mod server;

pub use client::HubConnector;
pub use server::HubServer;

/// Default per-client send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of invocations buffered per client.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// Errors raised by hub clients and the hub transport.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Client '{0}' disconnected")]
    Disconnected(String),

    #[error("Client '{0}' buffer full, invocation dropped")]
    Full(String),

    #[error("Send to client '{client}' timed out after {timeout:?}")]
    Timeout { client: String, timeout: Duration },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A server-initiated method call, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubInvocation {
    /// Method name, e.g. `InventoryUpdated`.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
}

impl HubInvocation {
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

/// A connected live client.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Stable id, unique within the registry.
    fn id(&self) -> &str;

    /// Deliver one invocation.
    async fn send(&self, invocation: Arc<HubInvocation>) -> Result<(), HubError>;

    /// Whether the client is gone for good and can be dropped from the registry.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Client handle backed by a bounded channel drained by the connection task.
///
/// Sends never wait: a client whose buffer is full misses the invocation.
pub struct ChannelClient {
    id: String,
    sender: mpsc::Sender<Arc<HubInvocation>>,
}

impl ChannelClient {
    /// Create a client with a fresh id and the receiving half of its queue.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Arc<HubInvocation>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let client = Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
        };
        (client, receiver)
    }
}

#[async_trait]
impl HubClient for ChannelClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, invocation: Arc<HubInvocation>) -> Result<(), HubError> {
        self.sender.try_send(invocation).map_err(|e| match e {
            TrySendError::Full(_) => HubError::Full(self.id.clone()),
            TrySendError::Closed(_) => HubError::Disconnected(self.id.clone()),
        })
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Outcome of one broadcast. Failures are counted, never raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Closed or stalled clients removed from the registry after the batch.
    pub pruned: usize,
}

/// Fan-out of a method invocation to every client on a channel.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, channel: &str, method: &str, args: Vec<Value>) -> BroadcastReport;
}

/// Push hub configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Host to bind the WebSocket endpoint to.
    pub host: String,
    /// Port for the WebSocket endpoint.
    pub port: u16,
    /// Channels served under `/hubs/{channel}`. Empty accepts any channel.
    pub channels: Vec<String>,
    /// Per-client send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Invocations buffered per client; further invocations are dropped for
    /// that client until it catches up.
    pub client_buffer: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            channels: vec![
                "product".to_string(),
                "inventory".to_string(),
                "order".to_string(),
            ],
            send_timeout_ms: DEFAULT_SEND_TIMEOUT.as_millis() as u64,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn serves(&self, channel: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel)
    }
}

/// Registry of connected clients per channel.
///
/// Broadcasts copy the member list under the read lock and send after
/// releasing it, so register/unregister never wait on a slow client.
/// A client that reports itself closed, or whose send outlives the send
/// timeout, is removed after the batch.
pub struct HubRegistry {
    channels: RwLock<HashMap<String, Vec<Arc<dyn HubClient>>>>,
    send_timeout: Duration,
}

impl HubRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Add a client to a channel. Re-registering an id replaces the old handle.
    pub async fn register(&self, channel: &str, client: Arc<dyn HubClient>) {
        let mut channels = self.channels.write().await;
        let members = channels.entry(channel.to_string()).or_default();
        members.retain(|c| c.id() != client.id());
        debug!(channel = %channel, client_id = %client.id(), "Client registered");
        members.push(client);
    }

    /// Remove a client. Returns whether it was registered.
    pub async fn unregister(&self, channel: &str, client_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let Some(members) = channels.get_mut(channel) else {
            return false;
        };

        let before = members.len();
        members.retain(|c| c.id() != client_id);
        let removed = members.len() < before;

        if members.is_empty() {
            channels.remove(channel);
        }
        if removed {
            debug!(channel = %channel, client_id = %client_id, "Client unregistered");
        }
        removed
    }

    pub async fn client_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn prune(&self, channel: &str, closed: &[String]) -> usize {
        let mut removed = 0;
        for client_id in closed {
            if self.unregister(channel, client_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(channel = %channel, removed, "Removed disconnected clients during broadcast");
        }
        removed
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

#[async_trait]
impl Broadcaster for HubRegistry {
    async fn broadcast(&self, channel: &str, method: &str, args: Vec<Value>) -> BroadcastReport {
        let members: Vec<Arc<dyn HubClient>> = self
            .channels
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default();

        if members.is_empty() {
            debug!(channel = %channel, method = %method, "No clients connected, dropping broadcast");
            return BroadcastReport::default();
        }

        let invocation = Arc::new(HubInvocation::new(method, args));
        let timeout = self.send_timeout;

        let sends = members.iter().map(|client| {
            let invocation = Arc::clone(&invocation);
            async move {
                tokio::time::timeout(timeout, client.send(invocation))
                    .await
                    .unwrap_or_else(|_| {
                        Err(HubError::Timeout {
                            client: client.id().to_string(),
                            timeout,
                        })
                    })
            }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        for (client, result) in members.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        channel = %channel,
                        method = %method,
                        client_id = %client.id(),
                        error = %e,
                        "Failed to send invocation to client"
                    );
                    if client.is_closed() || matches!(e, HubError::Timeout { .. }) {
                        closed.push(client.id().to_string());
                    }
                }
            }
        }

        if !closed.is_empty() {
            report.pruned = self.prune(channel, &closed).await;
        }

        debug!(
            channel = %channel,
            method = %method,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );

        report
    }
}

#[cfg(test)]
mod tests;
