//! Connection supervisor for outbound push-hub connections.
//!
//! Each target gets its own task. A task keeps attempting to connect with
//! linear backoff until it succeeds, runs out of attempts, or the shared
//! shutdown signal fires. A connection that reports its loss sends the
//! target back to `Connecting` with a fresh retry budget; one that does not
//! ends supervision once it is up.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::utils::retry::RetryPolicy;
use crate::utils::shutdown::cancelled;

/// Error returned by a failed connection attempt.
pub type ConnectError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the supervisor itself.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid transition for '{target}': {from} -> {to}")]
    InvalidTransition {
        target: String,
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// A named push hub to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionTarget {
    /// Human-readable name, unique per supervisor.
    pub name: String,
    /// WebSocket URL of the hub, e.g. `ws://inventory:8080/hubs/inventory`.
    pub url: String,
    /// Local broadcast channel for invocations received from this hub.
    /// Defaults to the target name.
    #[serde(default)]
    pub channel: Option<String>,
}

impl ConnectionTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            channel: None,
        }
    }

    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or(&self.name)
    }
}

/// Lifecycle of one supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    Connecting,
    Connected,
    /// Attempt number `retry_count` failed; a retry is pending.
    Failed { retry_count: usize },
    GivenUp,
}

impl ConnectionState {
    fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connected, Self::Connecting)
                | (Self::Connecting, Self::Failed { .. })
                | (Self::Connecting, Self::GivenUp)
                | (Self::Failed { .. }, Self::Connecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("NotStarted"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
            Self::Failed { retry_count } => write!(f, "Failed({})", retry_count),
            Self::GivenUp => f.write_str("GivenUp"),
        }
    }
}

/// A target plus its current state. Only `transition` mutates the state.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    target: ConnectionTarget,
    state: ConnectionState,
}

impl ConnectionDescriptor {
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            state: ConnectionState::NotStarted,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, rejecting edges outside the lifecycle.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), SupervisorError> {
        if !self.state.can_transition_to(&next) {
            return Err(SupervisorError::InvalidTransition {
                target: self.target.name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// An established connection, owned elsewhere once handed back.
pub struct Connection {
    lost: Option<BoxFuture<'static, ()>>,
}

impl Connection {
    /// A connection whose liveness is not reported.
    pub fn detached() -> Self {
        Self { lost: None }
    }

    /// A connection that is gone once `lost` resolves.
    pub fn monitored(lost: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            lost: Some(Box::pin(lost)),
        }
    }
}

/// Establishes a connection to a target.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, ConnectError>;
}

type Descriptors = Arc<RwLock<HashMap<String, ConnectionDescriptor>>>;

/// Starts one supervision task per target.
pub struct Supervisor {
    policy: RetryPolicy,
    cancel: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy, cancel: watch::Receiver<bool>) -> Self {
        Self { policy, cancel }
    }

    /// Spawn supervision for every target. Duplicate names are skipped.
    pub fn supervise(
        &self,
        targets: Vec<ConnectionTarget>,
        connector: Arc<dyn Connector>,
    ) -> SupervisorHandle {
        let mut descriptors = HashMap::new();
        let mut unique = Vec::new();
        for target in targets {
            if descriptors.contains_key(&target.name) {
                warn!(target = %target.name, "Duplicate push hub target ignored");
                continue;
            }
            descriptors.insert(target.name.clone(), ConnectionDescriptor::new(target.clone()));
            unique.push(target);
        }

        let states: Descriptors = Arc::new(RwLock::new(descriptors));

        let tasks = unique
            .into_iter()
            .map(|target| {
                let name = target.name.clone();
                let task = tokio::spawn(supervise_target(
                    target,
                    Arc::clone(&connector),
                    self.policy,
                    Arc::clone(&states),
                    self.cancel.clone(),
                ));
                (name, task)
            })
            .collect();

        SupervisorHandle { states, tasks }
    }
}

/// Observes and awaits running supervision tasks.
pub struct SupervisorHandle {
    states: Descriptors,
    tasks: Vec<(String, JoinHandle<ConnectionState>)>,
}

impl SupervisorHandle {
    pub async fn state(&self, name: &str) -> Option<ConnectionState> {
        self.states.read().await.get(name).map(|d| d.state())
    }

    /// Current state of every target, sorted by name.
    pub async fn snapshot(&self) -> Vec<(String, ConnectionState)> {
        let states = self.states.read().await;
        let mut snapshot: Vec<_> = states
            .iter()
            .map(|(name, d)| (name.clone(), d.state()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Wait for every task and return where each target ended up.
    pub async fn join(self) -> Vec<(String, ConnectionState)> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for (name, task) in self.tasks {
            let state = match task.await {
                Ok(state) => state,
                Err(e) => {
                    error!(target = %name, error = %e, "Supervision task failed");
                    self.states
                        .read()
                        .await
                        .get(&name)
                        .map(|d| d.state())
                        .unwrap_or(ConnectionState::NotStarted)
                }
            };
            results.push((name, state));
        }
        results
    }
}

async fn set_state(states: &Descriptors, name: &str, next: ConnectionState) {
    if let Some(descriptor) = states.write().await.get_mut(name) {
        if let Err(e) = descriptor.transition(next) {
            error!(error = %e, "Rejected connection state change");
        }
    }
}

async fn current_state(states: &Descriptors, name: &str) -> ConnectionState {
    states
        .read()
        .await
        .get(name)
        .map(|d| d.state())
        .unwrap_or(ConnectionState::NotStarted)
}

/// Supervise one target until it gives up or is cancelled.
async fn supervise_target(
    target: ConnectionTarget,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    states: Descriptors,
    mut cancel: watch::Receiver<bool>,
) -> ConnectionState {
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        set_state(&states, &target.name, ConnectionState::Connecting).await;

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                info!(target = %target.name, "Connection supervision cancelled");
                return current_state(&states, &target.name).await;
            }
            result = connector.connect(&target) => result,
        };

        let error = match result {
            Ok(connection) => {
                set_state(&states, &target.name, ConnectionState::Connected).await;
                info!(
                    target = %target.name,
                    url = %target.url,
                    attempt,
                    "Connected to push hub"
                );

                let Some(lost) = connection.lost else {
                    return ConnectionState::Connected;
                };
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        info!(target = %target.name, "Connection supervision cancelled");
                        return ConnectionState::Connected;
                    }
                    _ = lost => {}
                }

                warn!(target = %target.name, url = %target.url, "Push hub connection lost, reconnecting");
                backoff = policy.backoff();
                attempt = 0;
                continue;
            }
            Err(e) => e,
        };

        let Some(delay) = backoff.next() else {
            set_state(&states, &target.name, ConnectionState::GivenUp).await;
            error!(
                target = %target.name,
                url = %target.url,
                attempts = attempt,
                error = %error,
                "Giving up on push hub"
            );
            return ConnectionState::GivenUp;
        };

        set_state(
            &states,
            &target.name,
            ConnectionState::Failed {
                retry_count: attempt,
            },
        )
        .await;
        warn!(
            target = %target.name,
            attempt,
            max_attempts = policy.max_attempts,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Push hub connection failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                info!(target = %target.name, "Connection supervision cancelled during backoff");
                return current_state(&states, &target.name).await;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests;
