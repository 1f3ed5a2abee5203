//! In-memory stand-ins for the cluster and node APIs.
//!
//! `FakeController` records every resource operation and lets a test fail
//! individual operations or force a resource's phase. `FakeClients` hands out
//! node clients whose health answer can be switched per host while a test
//! runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netrunner::client::{ClientError, ClientFactory, Endpoint, NodeClient, NodeId};
use netrunner::config::{BackendConfig, NetworkConfig, NodeConfig, ResourceConfig};
use netrunner::controller::{
    ControllerError, NodeResource, ResourceController, ResourcePhase, ResourceRef, ResourceStatus,
};
use netrunner::node::Backends;
use serde_json::{Value, json};

pub const NAMESPACE: &str = "test";
pub const NODE_TYPE: &str = "odyssey";
pub const IMAGE: &str = "registry.local/odysseygo:test";
pub const GENESIS: &str = r#"{"networkID":1337,"allocations":[]}"#;

/// Node config for a resource-backed node in the test namespace.
pub fn resource_node(name: &str, is_beacon: bool) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        backend: Some(BackendConfig::Resource(ResourceConfig {
            namespace: NAMESPACE.to_string(),
            node_type: NODE_TYPE.to_string(),
            api_version: "chain.netrunner.dev/v1alpha1".to_string(),
            kind: "Node".to_string(),
            api_port: None,
        })),
        is_beacon,
        staking_key: format!("key-{name}").into_bytes(),
        staking_cert: format!("cert-{name}").into_bytes(),
        genesis: GENESIS.as_bytes().to_vec(),
        config_file: None,
        chain_config_file: None,
    }
}

/// A network of resource nodes named `names`; the first one is the beacon.
pub fn resource_network(names: &[&str]) -> NetworkConfig {
    network(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| resource_node(name, i == 0))
            .collect(),
    )
}

pub fn network(nodes: Vec<NodeConfig>) -> NetworkConfig {
    NetworkConfig {
        name: "test-net".to_string(),
        node_configs: nodes,
        binaries: [(NODE_TYPE.to_string(), IMAGE.to_string())].into(),
        health_check_interval: Duration::from_millis(10),
        health_check_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn host(name: &str) -> String {
    format!("{name}.{NAMESPACE}.svc")
}

pub fn backends(controller: &Arc<FakeController>, clients: &Arc<FakeClients>) -> Backends {
    Backends::new(clients.clone()).with_controller(controller.clone())
}

#[derive(Default)]
struct ControllerState {
    resources: BTreeMap<String, NodeResource>,
    phases: HashMap<String, ResourcePhase>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    hang_delete: HashSet<String>,
    applied: Vec<String>,
    deleted: Vec<String>,
}

/// Resource controller that keeps resources in memory.
///
/// Applied resources are `Running` unless a phase is forced.
#[derive(Default)]
pub struct FakeController {
    state: Mutex<ControllerState>,
    apply_delay: Duration,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Controller whose `apply` takes `delay` to be accepted.
    pub fn with_apply_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            apply_delay: delay,
            ..Self::default()
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_apply(&self, name: &str) {
        self.state().fail_apply.insert(name.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.state().fail_delete.insert(name.to_string());
    }

    /// Make deletes of `name` never complete, like an unresponsive API server.
    pub fn hang_delete(&self, name: &str) {
        self.state().hang_delete.insert(name.to_string());
    }

    pub fn set_phase(&self, name: &str, phase: ResourcePhase) {
        self.state().phases.insert(name.to_string(), phase);
    }

    /// Names of resources that currently exist.
    pub fn resources(&self) -> Vec<String> {
        self.state().resources.keys().cloned().collect()
    }

    pub fn resource(&self, name: &str) -> Option<NodeResource> {
        self.state().resources.get(name).cloned()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    fn rejected(resource: &ResourceRef, reason: &str) -> ControllerError {
        ControllerError::InvalidResource {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ResourceController for FakeController {
    async fn apply(&self, resource: &NodeResource) -> Result<(), ControllerError> {
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let name = resource.reference.name.clone();
        let mut state = self.state();
        if state.fail_apply.contains(&name) {
            return Err(Self::rejected(&resource.reference, "apply refused"));
        }
        state.applied.push(name.clone());
        state.resources.insert(name, resource.clone());
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ControllerError> {
        let hangs = self.state().hang_delete.contains(&resource.name);
        if hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        if state.fail_delete.contains(&resource.name) {
            return Err(Self::rejected(resource, "delete refused"));
        }
        state.deleted.push(resource.name.clone());
        state.resources.remove(&resource.name);
        Ok(())
    }

    async fn status(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ControllerError> {
        let state = self.state();
        if !state.resources.contains_key(&resource.name) {
            return Ok(None);
        }
        let phase = state
            .phases
            .get(&resource.name)
            .cloned()
            .unwrap_or(ResourcePhase::Running);
        Ok(Some(ResourceStatus {
            message: (phase == ResourcePhase::Failed).then(|| "image pull failed".to_string()),
            phase,
        }))
    }
}

/// How a fake node answers health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// Up but still bootstrapping.
    Bootstrapping,
    /// Refuses connections.
    Unreachable,
    /// Answers with a well-formed error.
    Broken,
}

#[derive(Default)]
struct Behaviors {
    default: Option<Behavior>,
    by_host: HashMap<String, Behavior>,
}

/// Client factory whose clients answer as configured per host.
#[derive(Default)]
pub struct FakeClients {
    behaviors: Arc<Mutex<Behaviors>>,
}

impl FakeClients {
    pub fn new(default: Behavior) -> Arc<Self> {
        let clients = Self::default();
        clients.behaviors.lock().unwrap().default = Some(default);
        Arc::new(clients)
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Behavior::Healthy)
    }

    pub fn set(&self, host: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .by_host
            .insert(host.to_string(), behavior);
    }
}

impl ClientFactory for FakeClients {
    fn client(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeClient>, ClientError> {
        Ok(Arc::new(FakeClient {
            host: endpoint.host.clone(),
            behaviors: self.behaviors.clone(),
        }))
    }
}

struct FakeClient {
    host: String,
    behaviors: Arc<Mutex<Behaviors>>,
}

impl FakeClient {
    fn behavior(&self) -> Behavior {
        let behaviors = self.behaviors.lock().unwrap();
        behaviors
            .by_host
            .get(&self.host)
            .copied()
            .or(behaviors.default)
            .unwrap_or(Behavior::Healthy)
    }

    fn answer(&self) -> Result<(), ClientError> {
        match self.behavior() {
            Behavior::Unreachable => Err(ClientError::Unreachable(format!(
                "connection refused by {}",
                self.host
            ))),
            Behavior::Broken => Err(ClientError::Rpc {
                code: -32000,
                message: "node is broken".to_string(),
            }),
            Behavior::Healthy | Behavior::Bootstrapping => Ok(()),
        }
    }
}

#[async_trait]
impl NodeClient for FakeClient {
    async fn health(&self) -> Result<bool, ClientError> {
        self.answer()?;
        Ok(self.behavior() == Behavior::Healthy)
    }

    async fn node_id(&self) -> Result<NodeId, ClientError> {
        self.answer()?;
        format!("NodeID-{}", self.host).parse()
    }

    async fn call(&self, path: &str, method: &str, _params: Value) -> Result<Value, ClientError> {
        self.answer()?;
        Ok(json!({ "path": path, "method": method }))
    }
}
