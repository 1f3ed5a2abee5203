//! Node handles.
//!
//! A [`Node`] is one running instance in a network, whatever deploys it. The
//! network manager and health aggregator only ever see `Arc<dyn Node>`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{ClientFactory, HttpClientFactory, NodeClient, NodeId};
use crate::config::{BackendConfig, BackendKind, NodeConfig, keys};
use crate::controller::ResourceController;
use crate::error::{ConfigError, Error, Result};
use crate::ports::{DEFAULT_API_PORT, DEFAULT_PEER_PORT, NodePorts};

pub mod process;
pub mod resource;

pub use process::ProcessNode;
pub use resource::ResourceNode;

/// Where a node is in its lifecycle.
///
/// `Created -> Starting -> Healthy | Failed`, and any state may move to
/// `Stopped`. `Failed` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Created,
    Starting,
    Healthy,
    Failed,
    Stopped,
}

impl NodeState {
    /// Whether the node can never become healthy again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Why a single health probe did not report the node healthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthCheckError {
    /// The probe failed in a way that may resolve itself; poll again.
    #[error("{0}")]
    Transient(String),
    /// The node will never become healthy.
    #[error("{0}")]
    Terminal(String),
}

/// A running node, independent of how it is deployed.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> BackendKind;

    fn state(&self) -> NodeState;

    /// Client for the node's API.
    fn client(&self) -> Arc<dyn NodeClient>;

    /// Launch the node. Returns once the backend has accepted the launch,
    /// not once the node is healthy.
    async fn start(&self) -> Result<()>;

    /// Stop the node, giving up waiting for it at `deadline`.
    ///
    /// Stopping a node that is already stopped succeeds.
    async fn stop(&self, deadline: Instant) -> Result<()>;

    /// Probe the node once.
    ///
    /// `Ok(false)` means the node is up but not ready yet.
    async fn health(&self) -> std::result::Result<bool, HealthCheckError>;

    /// The node's identity. Only available once it has been observed healthy.
    async fn identity(&self) -> Result<NodeId>;
}

impl fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("backend", &self.backend())
            .field("state", &self.state())
            .finish()
    }
}

/// State shared by every backend: lifecycle tracking and the identity cache.
pub struct NodeCore {
    name: String,
    state: Mutex<NodeState>,
    client: Arc<dyn NodeClient>,
    identity: OnceCell<NodeId>,
}

impl NodeCore {
    pub fn new(name: impl Into<String>, client: Arc<dyn NodeClient>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(NodeState::Created),
            client,
            identity: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> Arc<dyn NodeClient> {
        self.client.clone()
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> NodeState {
        *self.lock()
    }

    /// Move `Created -> Starting`. A node can only be started once.
    pub fn begin_start(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            NodeState::Created => {
                *state = NodeState::Starting;
                Ok(())
            }
            NodeState::Stopped => Err(Error::NetworkStopped),
            other => Err(Error::Unhealthy {
                node: self.name.clone(),
                reason: format!("cannot start a node that is {other}"),
            }),
        }
    }

    /// Record a failure. Has no effect once the node is stopped.
    pub fn fail(&self) {
        let mut state = self.lock();
        if *state != NodeState::Stopped {
            *state = NodeState::Failed;
        }
    }

    /// Move to `Stopped`, returning the previous state.
    pub fn mark_stopped(&self) -> NodeState {
        std::mem::replace(&mut *self.lock(), NodeState::Stopped)
    }

    /// Fold one health probe into the lifecycle.
    ///
    /// A healthy probe moves `Starting -> Healthy`; a terminal error moves the
    /// node to `Failed`. A stopped or failed node is always reported terminal.
    pub fn observe(
        &self,
        probe: std::result::Result<bool, HealthCheckError>,
    ) -> std::result::Result<bool, HealthCheckError> {
        let mut state = self.lock();
        if state.is_terminal() {
            return Err(HealthCheckError::Terminal(format!("node is {}", *state)));
        }
        match &probe {
            Ok(true) if *state == NodeState::Starting => {
                debug!(node = %self.name, "node observed healthy");
                *state = NodeState::Healthy;
            }
            Err(HealthCheckError::Terminal(_)) => *state = NodeState::Failed,
            _ => {}
        }
        probe
    }

    /// Fetch the node's identity once it is healthy, caching it.
    pub async fn identity(&self) -> Result<NodeId> {
        if self.state() != NodeState::Healthy {
            return Err(Error::NotReady(self.name.clone()));
        }
        let id = self
            .identity
            .get_or_try_init(|| async { self.client.node_id().await })
            .await?;
        Ok(id.clone())
    }
}

/// Map a client failure during a health probe onto the probe taxonomy.
pub(crate) fn classify(error: crate::client::ClientError) -> HealthCheckError {
    if error.is_transient() {
        HealthCheckError::Transient(error.to_string())
    } else {
        HealthCheckError::Terminal(error.to_string())
    }
}

/// Pluggable capabilities nodes are built with.
#[derive(Clone)]
pub struct Backends {
    pub clients: Arc<dyn ClientFactory>,
    pub controller: Option<Arc<dyn ResourceController>>,
}

impl Backends {
    pub fn new(clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            clients,
            controller: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn ResourceController>) -> Self {
        self.controller = Some(controller);
        self
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self::new(Arc::new(HttpClientFactory::default()))
    }
}

/// Network-level inputs for building one node.
pub struct NodeContext<'a> {
    pub network: &'a str,
    pub log_level: &'a str,
    /// Binary path or image by node type.
    pub binaries: &'a BTreeMap<String, String>,
    /// Parent of process-backed node home directories.
    pub root_dir: &'a Path,
    pub ports: NodePorts,
    /// Peer addresses of the beacon nodes this node bootstraps from.
    pub bootstrap_ips: Vec<String>,
    /// How long a process-backed node gets to exit after SIGTERM.
    pub stop_grace_period: Duration,
    pub backends: &'a Backends,
}

impl NodeContext<'_> {
    fn binary(&self, node_type: &str) -> Result<&str> {
        self.binaries
            .get(node_type)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingBinary(node_type.to_string()).into())
    }
}

/// Build the node described by `config`, picking the backend from its tag.
///
/// `config.name` must already be resolved.
pub fn build(config: NodeConfig, ctx: &NodeContext<'_>) -> Result<Arc<dyn Node>> {
    let backend = config
        .backend
        .clone()
        .ok_or(ConfigError::MissingBackendConfig)?;
    let node: Arc<dyn Node> = match backend {
        BackendConfig::Process(process) => {
            let binary = ctx.binary(&process.node_type)?;
            Arc::new(ProcessNode::new(config, binary, ctx)?)
        }
        BackendConfig::Resource(resource) => {
            let image = ctx.binary(&resource.node_type)?;
            let controller = ctx.backends.controller.clone().ok_or(Error::NoController)?;
            Arc::new(ResourceNode::new(config, &resource, image, controller, ctx)?)
        }
    };
    Ok(node)
}

/// Ports `config` will listen on.
///
/// Explicit backend settings win over the overlay's `http-port` and
/// `staking-port`. Process nodes otherwise get `allocated`; resource nodes
/// each have their own address, so they use the default ports.
pub fn resolve_ports(config: &NodeConfig, allocated: NodePorts) -> NodePorts {
    let overlay = config.overlay().ok().flatten();
    let overlay_port = |key: &str| {
        overlay
            .as_ref()
            .and_then(|o| o.get(key))
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    };
    let api = overlay_port(keys::HTTP_PORT);
    let peer = overlay_port(keys::STAKING_PORT);
    match &config.backend {
        Some(BackendConfig::Process(process)) => NodePorts {
            api: process.api_port.or(api).unwrap_or(allocated.api),
            peer: process.peer_port.or(peer).unwrap_or(allocated.peer),
        },
        Some(BackendConfig::Resource(resource)) => NodePorts {
            api: resource.api_port.or(api).unwrap_or(DEFAULT_API_PORT),
            peer: peer.unwrap_or(DEFAULT_PEER_PORT),
        },
        None => allocated,
    }
}

/// Address other nodes use to reach `config`'s peer port.
pub fn peer_address(config: &NodeConfig, ports: NodePorts) -> String {
    match &config.backend {
        Some(BackendConfig::Resource(resource)) => {
            format!("{}:{}", resource::service_host(&config.name, &resource.namespace), ports.peer)
        }
        _ => format!("127.0.0.1:{}", ports.peer),
    }
}
