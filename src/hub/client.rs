//! Outbound connections to domain push hubs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Broadcaster, HubError, HubInvocation};
use crate::supervisor::{ConnectError, Connection, ConnectionTarget, Connector};
use crate::utils::shutdown::cancelled;

/// Default timeout for a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] that opens a WebSocket to a push hub.
///
/// A successful attempt hands the socket to a reader task that lives until
/// the hub closes it or shutdown is signalled. The returned connection
/// resolves its loss when the hub side goes away, so the supervisor
/// reconnects. With a relay configured, the hub's invocations are
/// re-broadcast on the target's local channel.
pub struct HubConnector {
    relay: Option<Arc<dyn Broadcaster>>,
    cancel: watch::Receiver<bool>,
    connect_timeout: Duration,
}

impl HubConnector {
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self {
            relay: None,
            cancel,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn Broadcaster>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, ConnectError> {
        let (socket, _response) =
            match tokio::time::timeout(self.connect_timeout, connect_async(target.url.as_str()))
                .await
            {
                Ok(result) => result.map_err(HubError::from)?,
                Err(_) => {
                    return Err(HubError::Connection(format!(
                        "connect to {} timed out after {:?}",
                        target.url, self.connect_timeout
                    ))
                    .into())
                }
            };

        let (lost_tx, lost_rx) = oneshot::channel();
        let target = target.clone();
        let relay = self.relay.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if read_hub(socket, &target, relay, cancel).await {
                let _ = lost_tx.send(());
            }
        });

        // A dropped sender means shutdown, not loss.
        Ok(Connection::monitored(async move {
            if lost_rx.await.is_err() {
                futures::future::pending::<()>().await;
            }
        }))
    }
}

/// Keep a hub connection open, relaying its invocations if configured.
///
/// Returns `true` when the hub side ended the connection.
async fn read_hub(
    mut socket: HubSocket,
    target: &ConnectionTarget,
    relay: Option<Arc<dyn Broadcaster>>,
    mut cancel: watch::Receiver<bool>,
) -> bool {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                let _ = socket.close(None).await;
                debug!(target = %target.name, "Closed push hub connection");
                return false;
            }
            frame = socket.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => relay_invocation(&text, target, relay.as_deref()).await,
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = socket.send(Message::Pong(data)).await {
                    warn!(target = %target.name, error = %e, "Failed to answer push hub ping");
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(target = %target.name, url = %target.url, "Push hub closed the connection");
                return true;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target = %target.name, error = %e, "Push hub connection lost");
                return true;
            }
        }
    }
}

async fn relay_invocation(text: &str, target: &ConnectionTarget, relay: Option<&dyn Broadcaster>) {
    let invocation: HubInvocation = match serde_json::from_str(text) {
        Ok(invocation) => invocation,
        Err(e) => {
            warn!(target = %target.name, error = %e, "Ignoring malformed push hub frame");
            return;
        }
    };

    match relay {
        Some(relay) => {
            relay
                .broadcast(target.channel(), &invocation.target, invocation.arguments)
                .await;
        }
        None => debug!(
            target = %target.name,
            method = %invocation.target,
            "Received push hub invocation"
        ),
    }
}
