//! The HTTP control plane, served on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use netrunner::control::{self, ControlClient, ControlError};
use netrunner::node::NodeState;
use netrunner::{BackendKind, Network};

use crate::harness::{self, FakeClients, FakeController};

async fn serve(network: Arc<Network>) -> ControlClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, control::router(network)).await.unwrap();
    });
    ControlClient::new(&format!("http://{addr}"), Duration::from_secs(10)).unwrap()
}

#[tokio::test]
async fn drives_a_network_over_http() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    let network = Arc::new(
        Network::new(
            harness::resource_network(&["n0", "n1"]),
            harness::backends(&controller, &clients),
        )
        .await
        .unwrap(),
    );
    let client = serve(network.clone()).await;

    assert_eq!(client.ping().await.unwrap().pid, std::process::id());
    assert_eq!(client.node_names().await.unwrap(), vec!["n0", "n1"]);
    client.health().await.unwrap();

    let info = client.node("n1").await.unwrap();
    assert_eq!(info.name, "n1");
    assert_eq!(info.state, NodeState::Healthy);
    assert_eq!(info.backend, BackendKind::Resource);
    assert_eq!(info.node_id.as_deref(), Some("NodeID-n1.test.svc"));

    let added = client
        .add_node(&harness::resource_node("", false))
        .await
        .unwrap();
    assert_eq!(added, "node-0");
    assert!(controller.resource("node-0").is_some());
    client.remove_node("node-0").await.unwrap();
    assert!(controller.resource("node-0").is_none());

    match client.node("node-0").await.unwrap_err() {
        ControlError::Server { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, r#"no node named "node-0""#);
        }
        other => panic!("unexpected {other:?}"),
    }
    match client.add_node(&harness::resource_node("n0", false)).await.unwrap_err() {
        ControlError::Server { status, .. } => assert_eq!(status, 400),
        other => panic!("unexpected {other:?}"),
    }

    client.stop().await.unwrap();
    assert!(network.is_stopped());
    assert!(controller.resources().is_empty());
    match client.node_names().await.unwrap_err() {
        ControlError::Server { status, .. } => assert_eq!(status, 409),
        other => panic!("unexpected {other:?}"),
    }
    // Stopping again is harmless.
    client.stop().await.unwrap();
}

#[tokio::test]
async fn unhealthy_network_reports_service_unavailable() {
    let controller = FakeController::new();
    let clients = FakeClients::healthy();
    clients.set(&harness::host("n1"), harness::Behavior::Broken);
    let network = Arc::new(
        Network::new(
            harness::resource_network(&["n0", "n1"]),
            harness::backends(&controller, &clients),
        )
        .await
        .unwrap(),
    );
    let client = serve(network.clone()).await;

    match client.health().await.unwrap_err() {
        ControlError::Server { status, message } => {
            assert_eq!(status, 503);
            assert!(message.contains("n1"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    network.stop(Duration::from_secs(5)).await.unwrap();
}
