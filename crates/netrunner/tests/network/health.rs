//! Readiness aggregation through the network.

use std::sync::Arc;
use std::time::Duration;

use netrunner::Network;
use netrunner::controller::ResourcePhase;
use netrunner::error::Error;
use netrunner::node::NodeState;

use crate::harness::{self, Behavior, FakeClients, FakeController};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

async fn start(
    names: &[&str],
    controller: &Arc<FakeController>,
    clients: &Arc<FakeClients>,
    timeout: Duration,
) -> Arc<Network> {
    let mut config = harness::resource_network(names);
    config.health_check_timeout = timeout;
    Arc::new(
        Network::new(config, harness::backends(controller, clients))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn waits_for_slow_nodes() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n1"), Behavior::Unreachable);
    controller.set_phase("n2", ResourcePhase::Pending);
    let network = start(&["n0", "n1", "n2"], &controller, &clients, Duration::from_secs(10)).await;

    let waiter = tokio::spawn({
        let network = network.clone();
        async move { network.healthy().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    clients.set(&harness::host("n1"), Behavior::Bootstrapping);
    controller.set_phase("n2", ResourcePhase::Running);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    clients.set(&harness::host("n1"), Behavior::Healthy);
    waiter.await.unwrap().unwrap();
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn failed_resource_fails_readiness() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n0"), Behavior::Unreachable);
    controller.set_phase("n1", ResourcePhase::Failed);
    let network = start(&["n0", "n1"], &controller, &clients, Duration::from_secs(10)).await;

    let err = network.healthy().await.unwrap_err();
    match err {
        Error::Unhealthy { node, reason } => {
            assert_eq!(node, "n1");
            assert_eq!(reason, "image pull failed");
        }
        other => panic!("unexpected {other:?}"),
    }
    let n1 = network.get_node("n1").await.unwrap();
    assert_eq!(n1.state(), NodeState::Failed);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn protocol_errors_are_terminal() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n0"), Behavior::Broken);
    let network = start(&["n0", "n1"], &controller, &clients, Duration::from_secs(10)).await;

    let err = network.healthy().await.unwrap_err();
    assert!(matches!(&err, Error::Unhealthy { node, .. } if node == "n0"), "{err:?}");
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn times_out_naming_pending_nodes() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n2"), Behavior::Unreachable);
    clients.set(&harness::host("n1"), Behavior::Bootstrapping);
    let network = start(&["n0", "n1", "n2"], &controller, &clients, Duration::from_millis(300)).await;

    let err = network.healthy().await.unwrap_err();
    match err {
        Error::HealthTimeout { pending } => assert_eq!(pending, vec!["n1", "n2"]),
        other => panic!("unexpected {other:?}"),
    }
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn stop_ends_a_pending_wait() {
    let controller = FakeController::new();
    let clients = FakeClients::new(Behavior::Unreachable);
    let network = start(&["n0", "n1"], &controller, &clients, Duration::from_secs(30)).await;

    let waiter = tokio::spawn({
        let network = network.clone();
        async move { network.healthy().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    network.stop(STOP_TIMEOUT).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::NetworkStopped)), "{result:?}");
}

#[tokio::test]
async fn removing_a_pending_node_fails_the_wait() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n1"), Behavior::Unreachable);
    let network = start(&["n0", "n1"], &controller, &clients, Duration::from_secs(30)).await;

    let waiter = tokio::spawn({
        let network = network.clone();
        async move { network.healthy().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    network.remove_node("n1").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(&result, Err(Error::Unhealthy { node, .. }) if node == "n1"),
        "{result:?}"
    );

    // The remaining membership can still become healthy.
    network.healthy().await.unwrap();
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn concurrent_waiters_agree() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    let network = start(&["n0", "n1", "n2"], &controller, &clients, Duration::from_secs(10)).await;

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let network = network.clone();
            tokio::spawn(async move { network.healthy().await })
        })
        .collect();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    network.stop(STOP_TIMEOUT).await.unwrap();
}
