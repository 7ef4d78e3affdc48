use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::*;
use crate::utils::shutdown;

/// Connector that follows a script of outcomes and records attempt times.
struct ScriptedConnector {
    outcomes: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedConnector {
    fn new(outcomes: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(std::iter::empty())
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn waits(&self) -> Vec<Duration> {
        let attempts = self.attempts.lock().unwrap();
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, ConnectError> {
        self.attempts.lock().unwrap().push(tokio::time::Instant::now());
        let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
        if succeed {
            Ok(Connection::detached())
        } else {
            Err(format!("{} unreachable", target.url).into())
        }
    }
}

/// Connector that fails for one target name and succeeds for the rest.
struct SelectiveConnector {
    failing: String,
}

#[async_trait]
impl Connector for SelectiveConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, ConnectError> {
        if target.name == self.failing {
            Err("refused".into())
        } else {
            Ok(Connection::detached())
        }
    }
}

/// Connector whose connections drop when the test says so.
#[derive(Default)]
struct DroppableConnector {
    links: Mutex<Vec<tokio::sync::oneshot::Sender<()>>>,
}

impl DroppableConnector {
    fn attempt_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    fn drop_link(&self, index: usize) {
        let (unused, _) = tokio::sync::oneshot::channel();
        let link = std::mem::replace(&mut self.links.lock().unwrap()[index], unused);
        link.send(()).unwrap();
    }
}

#[async_trait]
impl Connector for DroppableConnector {
    async fn connect(&self, _target: &ConnectionTarget) -> Result<Connection, ConnectError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.links.lock().unwrap().push(tx);
        Ok(Connection::monitored(async move {
            let _ = rx.await;
        }))
    }
}

fn target(name: &str) -> ConnectionTarget {
    ConnectionTarget::new(name, format!("ws://{}:8080/hubs/{}", name, name))
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_then_success_connects() {
    let (_tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::new([false, false, false, false, true]);

    let handle = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("inventory")], connector.clone());
    let results = handle.join().await;

    assert_eq!(
        results,
        vec![("inventory".to_string(), ConnectionState::Connected)]
    );
    assert_eq!(connector.attempt_count(), 5);

    let waits = connector.waits();
    assert_eq!(waits.len(), 4);
    for (wait, expected_secs) in waits.iter().zip([5u64, 10, 15, 20]) {
        let expected = Duration::from_secs(expected_secs);
        assert!(
            *wait >= expected && *wait < expected + Duration::from_millis(10),
            "waited {:?}, expected {:?}",
            wait,
            expected
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_five_failures_gives_up_without_sixth_attempt() {
    let (_tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::always_failing();

    let handle = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("order")], connector.clone());
    let results = handle.join().await;

    assert_eq!(results, vec![("order".to_string(), ConnectionState::GivenUp)]);
    assert_eq!(connector.attempt_count(), 5);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempt_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_success_needs_no_wait() {
    let (_tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::new([true]);

    let results = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("product")], connector.clone())
        .join()
        .await;

    assert_eq!(results[0].1, ConnectionState::Connected);
    assert!(connector.waits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_state_is_visible_during_backoff() {
    let (_tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::always_failing();

    let handle = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("inventory")], connector);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        handle.state("inventory").await,
        Some(ConnectionState::Failed { retry_count: 1 })
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        handle.state("inventory").await,
        Some(ConnectionState::Failed { retry_count: 2 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_targets_are_independent() {
    let (_tx, rx) = shutdown::channel();
    let connector = Arc::new(SelectiveConnector {
        failing: "order".to_string(),
    });

    let handle = Supervisor::new(RetryPolicy::default(), rx).supervise(
        vec![target("inventory"), target("order"), target("product")],
        connector,
    );

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
        handle.state("inventory").await,
        Some(ConnectionState::Connected)
    );
    assert_eq!(handle.state("product").await, Some(ConnectionState::Connected));

    let mut results = handle.join().await;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        results,
        vec![
            ("inventory".to_string(), ConnectionState::Connected),
            ("order".to_string(), ConnectionState::GivenUp),
            ("product".to_string(), ConnectionState::Connected),
        ]
    );
}

#[tokio::test]
async fn test_cancel_interrupts_backoff_promptly() {
    let (tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::always_failing();

    let handle = Supervisor::new(RetryPolicy::new(5, Duration::from_secs(5)), rx).supervise(
        vec![target("inventory"), target("order"), target("product")],
        connector.clone(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.attempt_count(), 3);

    let started = std::time::Instant::now();
    tx.send(true).unwrap();
    let results = tokio::time::timeout(Duration::from_millis(100), handle.join())
        .await
        .expect("all targets should stop within 100ms");

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(results.len(), 3);
    for (_, state) in results {
        assert_eq!(state, ConnectionState::Failed { retry_count: 1 });
    }
    assert_eq!(connector.attempt_count(), 3);
}

#[tokio::test]
async fn test_duplicate_target_names_are_supervised_once() {
    let (_tx, rx) = shutdown::channel();
    let connector = ScriptedConnector::new([true, true]);

    let results = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("inventory"), target("inventory")], connector.clone())
        .join()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_is_reestablished() {
    let (tx, rx) = shutdown::channel();
    let connector = Arc::new(DroppableConnector::default());

    let handle = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("inventory")], connector.clone());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(handle.state("inventory").await, Some(ConnectionState::Connected));

    connector.drop_link(0);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(connector.attempt_count(), 2);
    assert_eq!(handle.state("inventory").await, Some(ConnectionState::Connected));

    tx.send(true).unwrap();
    let results = handle.join().await;
    assert_eq!(
        results,
        vec![("inventory".to_string(), ConnectionState::Connected)]
    );
    assert_eq!(connector.attempt_count(), 2);
}

/// Hands out one droppable connection, then follows a script.
struct LoseOnceThenScript {
    first: DroppableConnector,
    rest: Arc<ScriptedConnector>,
}

#[async_trait]
impl Connector for LoseOnceThenScript {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, ConnectError> {
        if self.first.attempt_count() == 0 {
            self.first.connect(target).await
        } else {
            self.rest.connect(target).await
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_loss_gets_a_fresh_budget() {
    let (_tx, rx) = shutdown::channel();
    let connector = Arc::new(LoseOnceThenScript {
        first: DroppableConnector::default(),
        rest: ScriptedConnector::new([false, false, false, false, true]),
    });

    let handle = Supervisor::new(RetryPolicy::default(), rx)
        .supervise(vec![target("order")], connector.clone());

    tokio::time::sleep(Duration::from_millis(1)).await;
    connector.first.drop_link(0);

    let results = handle.join().await;
    assert_eq!(results, vec![("order".to_string(), ConnectionState::Connected)]);
    assert_eq!(connector.rest.attempt_count(), 5);
}

#[test]
fn test_descriptor_follows_lifecycle() {
    let mut descriptor = ConnectionDescriptor::new(target("inventory"));
    assert_eq!(descriptor.state(), ConnectionState::NotStarted);

    descriptor.transition(ConnectionState::Connecting).unwrap();
    descriptor
        .transition(ConnectionState::Failed { retry_count: 1 })
        .unwrap();
    descriptor.transition(ConnectionState::Connecting).unwrap();
    descriptor.transition(ConnectionState::Connected).unwrap();
    descriptor.transition(ConnectionState::Connecting).unwrap();
    descriptor.transition(ConnectionState::GivenUp).unwrap();

    assert_eq!(descriptor.state(), ConnectionState::GivenUp);
}

#[test]
fn test_descriptor_rejects_invalid_transitions() {
    let mut descriptor = ConnectionDescriptor::new(target("inventory"));

    assert!(descriptor.transition(ConnectionState::Connected).is_err());
    assert_eq!(descriptor.state(), ConnectionState::NotStarted);

    descriptor.transition(ConnectionState::Connecting).unwrap();
    descriptor.transition(ConnectionState::GivenUp).unwrap();
    let err = descriptor
        .transition(ConnectionState::Connecting)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid transition for 'inventory': GivenUp -> Connecting"
    );
}

#[test]
fn test_target_channel_defaults_to_name() {
    let mut t = target("inventory");
    assert_eq!(t.channel(), "inventory");
    t.channel = Some("stock".to_string());
    assert_eq!(t.channel(), "stock");
}
