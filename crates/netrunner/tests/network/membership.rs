//! Adding and removing nodes while the network runs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use netrunner::Network;
use netrunner::error::{ConfigError, Credential, Error};
use netrunner::node::NodeState;

use crate::harness::{self, FakeClients, FakeController};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

async fn start(controller: &Arc<FakeController>, names: &[&str]) -> Arc<Network> {
    let clients = FakeClients::healthy();
    Arc::new(
        Network::new(
            harness::resource_network(names),
            harness::backends(controller, &clients),
        )
        .await
        .unwrap(),
    )
}

#[tokio::test]
async fn added_nodes_join_the_network() {
    let controller = FakeController::new();
    let network = start(&controller, &["beacon"]).await;

    let named = network
        .add_node(harness::resource_node("extra", false))
        .await
        .unwrap();
    assert_eq!(named.name(), "extra");
    let unnamed = network
        .add_node(harness::resource_node("", false))
        .await
        .unwrap();
    assert_eq!(unnamed.name(), "node-0");

    assert_eq!(
        network.get_node_names().await.unwrap(),
        vec!["beacon", "extra", "node-0"]
    );
    assert_eq!(
        controller.resource("extra").unwrap().spec.bootstrap_ips,
        vec!["beacon.test.svc:9651"]
    );

    // Adding does not wait for health; asking does.
    network.healthy().await.unwrap();
    assert_eq!(named.state(), NodeState::Healthy);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn added_beacons_bootstrap_later_nodes() {
    let controller = FakeController::new();
    let network = start(&controller, &["b0"]).await;
    network
        .add_node(harness::resource_node("b1", true))
        .await
        .unwrap();
    network
        .add_node(harness::resource_node("follower", false))
        .await
        .unwrap();

    let mut bootstrap = controller.resource("follower").unwrap().spec.bootstrap_ips;
    bootstrap.sort();
    assert_eq!(bootstrap, vec!["b0.test.svc:9651", "b1.test.svc:9651"]);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn rejects_conflicting_nodes() {
    let controller = FakeController::new();
    let network = start(&controller, &["n0", "n1"]).await;

    let err = network
        .add_node(harness::resource_node("n1", false))
        .await
        .err()
        .unwrap();
    assert!(
        matches!(&err, Error::Config(ConfigError::DuplicateName(name)) if name == "n1"),
        "{err:?}"
    );

    let mut forked = harness::resource_node("forked", false);
    forked.genesis = br#"{"networkID":1338}"#.to_vec();
    let err = network.add_node(forked).await.err().unwrap();
    assert!(
        matches!(&err, Error::Config(ConfigError::GenesisMismatch { first, .. }) if first == "n0"),
        "{err:?}"
    );

    // Unnamed nodes are reported under the name they would have been given.
    let mut forked = harness::resource_node("", false);
    forked.genesis = br#"{"networkID":1338}"#.to_vec();
    let err = network.add_node(forked).await.err().unwrap();
    match err {
        Error::Config(ConfigError::GenesisMismatch { node, first }) => {
            assert_eq!(node, "node-0");
            assert_eq!(first, "n0");
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut keyless = harness::resource_node("keyless", false);
    keyless.staking_key.clear();
    let err = network.add_node(keyless).await.err().unwrap();
    match err {
        Error::Config(ConfigError::InvalidNode { node, source }) => {
            assert_eq!(node, "keyless");
            assert_eq!(*source, ConfigError::MissingCredential(Credential::StakingKey));
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(network.get_node_names().await.unwrap(), vec!["n0", "n1"]);
    assert_eq!(controller.applied(), vec!["n0", "n1"]);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn failed_add_releases_the_name() {
    let controller = FakeController::new();
    let network = start(&controller, &["n0"]).await;
    controller.fail_apply("late");

    let err = network
        .add_node(harness::resource_node("late", false))
        .await
        .err()
        .unwrap();
    assert!(matches!(&err, Error::Start { node, .. } if node == "late"), "{err:?}");
    assert_eq!(network.get_node_names().await.unwrap(), vec!["n0"]);

    let err = network.get_node("late").await.err().unwrap();
    assert!(matches!(err, Error::NodeNotFound(_)));
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn removed_nodes_are_stopped() {
    let controller = FakeController::new();
    let network = start(&controller, &["n0", "n1"]).await;
    let n1 = network.get_node("n1").await.unwrap();

    network.remove_node("n1").await.unwrap();
    assert_eq!(n1.state(), NodeState::Stopped);
    assert_eq!(controller.resources(), vec!["n0"]);
    assert_eq!(network.get_node_names().await.unwrap(), vec!["n0"]);

    let err = network.remove_node("n1").await.unwrap_err();
    assert!(matches!(&err, Error::NodeNotFound(name) if name == "n1"), "{err:?}");
    assert_eq!(network.get_node_names().await.unwrap(), vec!["n0"]);
    assert_eq!(controller.resources(), vec!["n0"]);
    let err = network.get_node("n1").await.err().unwrap();
    assert!(matches!(err, Error::NodeNotFound(_)));

    // The name can be reused once removed.
    network
        .add_node(harness::resource_node("n1", false))
        .await
        .unwrap();
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn concurrent_adds_of_one_name_admit_one() {
    let controller = FakeController::with_apply_delay(Duration::from_millis(20));
    let network = start(&controller, &["n0"]).await;

    let adds: Vec<_> = (0..6)
        .map(|_| {
            let network = network.clone();
            tokio::spawn(async move { network.add_node(harness::resource_node("dup", false)).await })
        })
        .collect();
    let mut admitted = 0;
    for add in adds {
        match add.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(Error::Config(ConfigError::DuplicateName(_))) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(admitted, 1);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn concurrent_unnamed_adds_get_distinct_names() {
    let controller = FakeController::with_apply_delay(Duration::from_millis(5));
    let network = start(&controller, &["beacon"]).await;

    let adds: Vec<_> = (0..8)
        .map(|_| {
            let network = network.clone();
            tokio::spawn(async move { network.add_node(harness::resource_node("", false)).await })
        })
        .collect();
    let mut names = BTreeSet::new();
    for add in adds {
        let node = add.await.unwrap().unwrap();
        assert!(names.insert(node.name().to_string()));
    }
    assert_eq!(names.len(), 8);
    assert_eq!(network.get_node_names().await.unwrap().len(), 9);
    network.stop(STOP_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn stop_during_add_leaves_nothing_running() {
    let controller = FakeController::with_apply_delay(Duration::from_millis(200));
    let network = start(&controller, &["n0"]).await;

    let add = tokio::spawn({
        let network = network.clone();
        async move { network.add_node(harness::resource_node("slow", false)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    network.stop(STOP_TIMEOUT).await.unwrap();

    let result = add.await.unwrap();
    assert!(matches!(result, Err(Error::NetworkStopped)), "{:?}", result.err());
    assert!(controller.resources().is_empty());
    assert!(controller.deleted().iter().any(|n| n == "slow"));
}
