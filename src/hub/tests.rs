use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use super::*;

/// Client whose sends always fail without being closed.
struct FailingClient {
    id: String,
    attempts: AtomicUsize,
}

impl FailingClient {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HubClient for FailingClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _invocation: Arc<HubInvocation>) -> Result<(), HubError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(HubError::Connection("socket reset".to_string()))
    }
}

/// Client whose sends never complete.
struct StalledClient;

#[async_trait]
impl HubClient for StalledClient {
    fn id(&self) -> &str {
        "stalled"
    }

    async fn send(&self, _invocation: Arc<HubInvocation>) -> Result<(), HubError> {
        futures::future::pending().await
    }
}

#[test]
fn test_invocation_wire_format() {
    let invocation = HubInvocation::new("InventoryUpdated", vec![json!(7), json!(3), json!(42)]);

    assert_eq!(
        serde_json::to_string(&invocation).unwrap(),
        r#"{"target":"InventoryUpdated","arguments":[7,3,42]}"#
    );
}

#[tokio::test]
async fn test_register_and_unregister() {
    let registry = HubRegistry::default();
    let (client, _rx) = ChannelClient::new(4);
    let id = client.id().to_string();

    registry.register("inventory", Arc::new(client)).await;
    assert_eq!(registry.client_count("inventory").await, 1);
    assert_eq!(registry.channels().await, vec!["inventory".to_string()]);

    assert!(registry.unregister("inventory", &id).await);
    assert!(!registry.unregister("inventory", &id).await);
    assert_eq!(registry.client_count("inventory").await, 0);
    assert!(registry.channels().await.is_empty());
}

#[tokio::test]
async fn test_register_same_id_replaces_handle() {
    let registry = HubRegistry::default();
    let failing = FailingClient::new("client-1");

    registry.register("order", failing.clone()).await;
    registry.register("order", failing).await;

    assert_eq!(registry.client_count("order").await, 1);
}

#[tokio::test]
async fn test_broadcast_to_empty_channel_is_noop() {
    let registry = HubRegistry::default();

    let report = registry.broadcast("product", "ProductCreated", vec![]).await;

    assert_eq!(report, BroadcastReport::default());
}

#[tokio::test]
async fn test_failing_client_does_not_stop_the_batch() {
    let registry = HubRegistry::default();
    let mut receivers = Vec::new();

    for k in 0..5 {
        if k == 2 {
            registry
                .register("inventory", FailingClient::new("broken"))
                .await;
            continue;
        }
        let (client, rx) = ChannelClient::new(4);
        registry.register("inventory", Arc::new(client)).await;
        receivers.push(rx);
    }

    let report = registry
        .broadcast("inventory", "InventoryUpdated", vec![json!(7), json!(3), json!(42)])
        .await;

    assert_eq!(report.delivered, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, 0);
    for rx in &mut receivers {
        let invocation = rx.try_recv().unwrap();
        assert_eq!(invocation.target, "InventoryUpdated");
        assert_eq!(invocation.arguments, vec![json!(7), json!(3), json!(42)]);
    }
    assert_eq!(registry.client_count("inventory").await, 5);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_client_times_out() {
    let registry = HubRegistry::new(Duration::from_millis(200));
    let (client, mut rx) = ChannelClient::new(4);
    registry.register("order", Arc::new(client)).await;
    registry.register("order", Arc::new(StalledClient)).await;

    let report = registry
        .broadcast("order", "OrderCreated", vec![json!(1), json!("Ada")])
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, 1);
    assert_eq!(registry.client_count("order").await, 1);
    assert_eq!(rx.try_recv().unwrap().target, "OrderCreated");
}

#[tokio::test]
async fn test_full_client_fails_without_waiting() {
    let (client, mut rx) = ChannelClient::new(1);

    client
        .send(Arc::new(HubInvocation::new("ProductCreated", vec![json!(1)])))
        .await
        .unwrap();
    let second = tokio::time::timeout(
        Duration::from_millis(100),
        client.send(Arc::new(HubInvocation::new("ProductCreated", vec![json!(2)]))),
    )
    .await
    .expect("send must not wait for buffer space");

    assert!(matches!(second, Err(HubError::Full(_))));
    assert!(!client.is_closed());
    assert_eq!(rx.try_recv().unwrap().arguments, vec![json!(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_full_client_does_not_delay_others() {
    let registry = HubRegistry::default();
    let (stuck, _stuck_rx) = ChannelClient::new(1);
    let (healthy, mut healthy_rx) = ChannelClient::new(16);
    registry.register("inventory", Arc::new(stuck)).await;
    registry.register("inventory", Arc::new(healthy)).await;

    let started = tokio::time::Instant::now();
    for quantity in 0..4 {
        registry
            .broadcast("inventory", "InventoryUpdated", vec![json!(7), json!(3), json!(quantity)])
            .await;
    }

    assert_eq!(started.elapsed(), Duration::ZERO);
    for quantity in 0..4 {
        assert_eq!(
            healthy_rx.try_recv().unwrap().arguments,
            vec![json!(7), json!(3), json!(quantity)]
        );
    }
    assert_eq!(registry.client_count("inventory").await, 2);
}

#[tokio::test]
async fn test_closed_clients_are_pruned() {
    let registry = HubRegistry::default();
    let (gone, gone_rx) = ChannelClient::new(4);
    let (alive, mut alive_rx) = ChannelClient::new(4);
    registry.register("product", Arc::new(gone)).await;
    registry.register("product", Arc::new(alive)).await;
    drop(gone_rx);

    let report = registry
        .broadcast("product", "ProductDeleted", vec![json!(12)])
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, 1);
    assert_eq!(registry.client_count("product").await, 1);
    assert_eq!(alive_rx.try_recv().unwrap().arguments, vec![json!(12)]);
}

#[tokio::test]
async fn test_broadcast_only_reaches_its_channel() {
    let registry = HubRegistry::default();
    let (inventory, mut inventory_rx) = ChannelClient::new(4);
    let (order, mut order_rx) = ChannelClient::new(4);
    registry.register("inventory", Arc::new(inventory)).await;
    registry.register("order", Arc::new(order)).await;

    registry
        .broadcast("order", "OrderStatusChanged", vec![json!(5), json!("Shipped")])
        .await;

    assert!(inventory_rx.try_recv().is_err());
    assert_eq!(order_rx.try_recv().unwrap().target, "OrderStatusChanged");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_churn_during_broadcasts() {
    const ROUNDS: usize = 200;

    let registry = Arc::new(HubRegistry::default());
    let mut stable = Vec::new();
    for _ in 0..3 {
        let (client, rx) = ChannelClient::new(ROUNDS);
        registry.register("inventory", Arc::new(client)).await;
        stable.push(rx);
    }

    let churn = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let (client, _rx) = ChannelClient::new(4);
                let id = client.id().to_string();
                registry.register("inventory", Arc::new(client)).await;
                tokio::task::yield_now().await;
                registry.unregister("inventory", &id).await;
            }
        })
    };
    let broadcasts = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for n in 0..ROUNDS {
                registry
                    .broadcast("inventory", "InventoryUpdated", vec![json!(n)])
                    .await;
            }
        })
    };

    let (churned, broadcast) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(churn, broadcasts)
    })
    .await
    .expect("churn and broadcasts should finish without deadlock");
    churned.unwrap();
    broadcast.unwrap();

    for rx in &mut stable {
        for n in 0..ROUNDS {
            assert_eq!(rx.try_recv().unwrap().arguments, vec![json!(n)]);
        }
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(registry.client_count("inventory").await, 3);
}

#[test]
fn test_hub_config_serves_configured_channels() {
    let config = HubConfig::default();
    assert!(config.serves("inventory"));
    assert!(!config.serves("supplier"));

    let open = HubConfig {
        channels: Vec::new(),
        ..Default::default()
    };
    assert!(open.serves("supplier"));
}
