//! WebSocket endpoint for live clients.
//!
//! Clients connect to `/hubs/{channel}`. Each connection is registered with
//! the [`HubRegistry`] for its channel and receives invocations as JSON text
//! frames until it disconnects or the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{ChannelClient, HubClient, HubConfig, HubError, HubInvocation, HubRegistry};
use crate::utils::shutdown::cancelled;

const HUB_PATH_PREFIX: &str = "/hubs/";

/// Extract the channel from a `/hubs/{channel}` request path.
fn channel_from_path(path: &str) -> Option<&str> {
    let channel = path.strip_prefix(HUB_PATH_PREFIX)?.trim_end_matches('/');
    if channel.is_empty() || channel.contains('/') {
        return None;
    }
    Some(channel)
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("No hub at {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Accept loop for the push hub.
pub struct HubServer {
    listener: TcpListener,
    registry: Arc<HubRegistry>,
    config: Arc<HubConfig>,
}

impl HubServer {
    /// Bind to the configured host and port.
    pub async fn bind(config: HubConfig, registry: Arc<HubRegistry>) -> Result<Self, HubError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self {
            listener,
            registry,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HubError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<(), HubError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Push hub listening");

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!(addr = %addr, "Push hub shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.registry),
                            Arc::clone(&self.config),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Push hub accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<HubRegistry>,
    config: Arc<HubConfig>,
    cancel: watch::Receiver<bool>,
) {
    let mut requested: Option<String> = None;
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        let path = request.uri().path();
        match channel_from_path(path).filter(|channel| config.serves(channel)) {
            Some(channel) => {
                requested = Some(channel.to_string());
                Ok(response)
            }
            None => Err(not_found(path)),
        }
    })
    .await;

    match (handshake, requested) {
        (Ok(ws), Some(channel)) => serve_client(ws, channel, peer, registry, config, cancel).await,
        (Ok(_), None) => error!(peer = %peer, "Handshake accepted without a channel"),
        (Err(e), _) => debug!(peer = %peer, error = %e, "Push hub handshake rejected"),
    }
}

/// Pump invocations to one client until either side goes away.
async fn serve_client(
    ws: WebSocketStream<TcpStream>,
    channel: String,
    peer: SocketAddr,
    registry: Arc<HubRegistry>,
    config: Arc<HubConfig>,
    mut cancel: watch::Receiver<bool>,
) {
    let (client, mut outbound) = ChannelClient::new(config.client_buffer);
    let client_id = client.id().to_string();
    registry.register(&channel, Arc::new(client)).await;
    info!(channel = %channel, client_id = %client_id, peer = %peer, "Live client connected");

    if let Err(e) = pump(ws, &mut outbound, config.heartbeat_interval(), &mut cancel).await {
        debug!(client_id = %client_id, error = %e, "Live client connection ended with error");
    }

    registry.unregister(&channel, &client_id).await;
    info!(channel = %channel, client_id = %client_id, "Live client disconnected");
}

async fn pump(
    ws: WebSocketStream<TcpStream>,
    outbound: &mut mpsc::Receiver<Arc<HubInvocation>>,
    heartbeat: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), HubError> {
    let (mut sink, mut inbound) = ws.split();
    let mut heartbeat = interval(heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            invocation = outbound.recv() => {
                let Some(invocation) = invocation else {
                    return Ok(());
                };
                let frame = serde_json::to_string(invocation.as_ref())?;
                sink.send(Message::Text(frame)).await?;
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = heartbeat.tick() => {
                sink.send(Message::Ping(Vec::new())).await?;
            }
        }
    }
}
