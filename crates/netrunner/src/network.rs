//! The network lifecycle manager.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, NetworkConfig, NodeConfig};
use crate::error::{ConfigError, Error, Result, StopErrors};
use crate::health;
use crate::node::{self, Backends, Node, NodeContext};
use crate::ports::{self, NodePorts};
use crate::validate::{genesis_network_id, validate_binaries, validate_network, validate_node};

/// How long nodes get to stop when a network cleans up after itself.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A node whose name and ports have been settled but which is not built yet.
struct Planned {
    config: NodeConfig,
    ports: NodePorts,
}

#[derive(Default)]
struct Members {
    nodes: BTreeMap<String, Arc<dyn Node>>,
    /// Names reserved by `add_node` calls that are still starting their node.
    starting: BTreeSet<String>,
    /// Peer address of every beacon member.
    beacons: BTreeMap<String, String>,
    /// Genesis every member shares, and the member it was first seen on.
    genesis: Option<(String, Vec<u8>)>,
    next_name: usize,
    next_port_slot: usize,
}

impl Members {
    fn is_taken(&self, name: &str) -> bool {
        self.nodes.contains_key(name) || self.starting.contains(name)
    }

    fn auto_name(&mut self, reserved: &BTreeSet<String>) -> String {
        loop {
            let candidate = format!("node-{}", self.next_name);
            self.next_name += 1;
            if !self.is_taken(&candidate) && !reserved.contains(&candidate) {
                return candidate;
            }
        }
    }

    fn allocate_ports(&mut self, config: &NodeConfig, network: &NetworkConfig) -> Result<NodePorts> {
        let slot = self.next_port_slot;
        self.next_port_slot += 1;
        let allocated = network
            .port_strategy
            .allocate(slot)
            .ok_or_else(|| Error::PortsExhausted(config.name.clone()))?;
        Ok(node::resolve_ports(config, allocated))
    }

    fn bootstrap_ips(&self, exclude: &str) -> Vec<String> {
        self.beacons
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .map(|(_, address)| address.clone())
            .collect()
    }
}

/// A running network of nodes.
///
/// Membership can change while the network runs. Once [`Network::stop`] has
/// been called the network is permanently stopped: every query reports so
/// and no node can be added.
pub struct Network {
    config: NetworkConfig,
    backends: Backends,
    root_dir: PathBuf,
    members: RwLock<Members>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    // Declared last so node homes outlive the nodes using them.
    _temp_dir: Option<TempDir>,
}

impl Network {
    /// Validate `config`, then start every node concurrently.
    ///
    /// If any node fails to start, the nodes that did start are stopped and
    /// the first failure is returned.
    pub async fn new(config: NetworkConfig, backends: Backends) -> Result<Self> {
        validate_network(&config)?;
        validate_binaries(&config)?;

        let (root_dir, temp_dir) = match &config.root_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                (dir.clone(), None)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(&format!("{}-", config.name))
                    .tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        info!(
            network = %config.name,
            nodes = config.node_configs.len(),
            root = %root_dir.display(),
            "creating network"
        );

        let mut members = Members::default();
        let reserved: BTreeSet<String> = config
            .node_configs
            .iter()
            .filter(|n| !n.name.is_empty())
            .map(|n| n.name.clone())
            .collect();
        let mut planned = Vec::with_capacity(config.node_configs.len());
        for node_config in &config.node_configs {
            let mut node_config = node_config.clone();
            if node_config.name.is_empty() {
                node_config.name = members.auto_name(&reserved);
            }
            let ports = members.allocate_ports(&node_config, &config)?;
            if node_config.is_beacon {
                members
                    .beacons
                    .insert(node_config.name.clone(), node::peer_address(&node_config, ports));
            }
            planned.push(Planned {
                config: node_config,
                ports,
            });
        }
        if let Some(first) = planned.first() {
            members.genesis = Some((first.config.name.clone(), first.config.genesis.clone()));
        }
        check_local_ports(&planned)?;

        let mut network = Self {
            config,
            backends,
            root_dir,
            members: RwLock::new(Members::default()),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            _temp_dir: temp_dir,
        };

        let mut nodes = Vec::with_capacity(planned.len());
        for plan in planned {
            let name = plan.config.name.clone();
            let bootstrap_ips = members.bootstrap_ips(&name);
            let node = network
                .build_node(plan, bootstrap_ips)
                .map_err(|source| Error::Start {
                    node: name,
                    source: Box::new(source),
                })?;
            nodes.push(node);
        }

        start_all(&nodes).await?;
        members.nodes = nodes
            .into_iter()
            .map(|node| (node.name().to_string(), node))
            .collect();
        network.members = RwLock::new(members);
        info!(network = %network.config.name, "network started");
        Ok(network)
    }

    fn build_node(&self, plan: Planned, bootstrap_ips: Vec<String>) -> Result<Arc<dyn Node>> {
        let ctx = NodeContext {
            network: &self.config.name,
            log_level: &self.config.log_level,
            binaries: &self.config.binaries,
            root_dir: &self.root_dir,
            ports: plan.ports,
            bootstrap_ips,
            stop_grace_period: self.config.stop_grace_period,
            backends: &self.backends,
        };
        node::build(plan.config, &ctx)
    }

    /// The network's name, as passed to every node.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration the network was created from.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Directory process-backed nodes keep their files under.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Whether [`Network::stop`] has been called. A stopped network rejects
    /// every further operation.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the network has been stopped.
    pub async fn wait_stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Wait until every current member is healthy.
    ///
    /// Fails on the first node that can never become healthy, when the
    /// configured health timeout elapses, or when the network is stopped.
    /// Nodes added after the call starts are not waited for.
    pub async fn healthy(&self) -> Result<()> {
        let nodes: Vec<_> = {
            let members = self.members.read().await;
            if self.is_stopped() {
                return Err(Error::NetworkStopped);
            }
            members.nodes.values().cloned().collect()
        };
        debug!(network = %self.config.name, nodes = nodes.len(), "waiting for nodes to become healthy");
        health::wait_healthy(
            nodes,
            self.config.health_check_interval,
            self.config.health_check_timeout,
            &self.shutdown,
        )
        .await
    }

    /// Add and start a node. Does not wait for it to become healthy.
    pub async fn add_node(&self, mut config: NodeConfig) -> Result<Arc<dyn Node>> {
        let (plan, bootstrap_ips) = {
            let mut members = self.members.write().await;
            if self.is_stopped() {
                return Err(Error::NetworkStopped);
            }

            if config.name.is_empty() {
                config.name = members.auto_name(&BTreeSet::new());
            } else if members.is_taken(&config.name) {
                return Err(ConfigError::DuplicateName(config.name).into());
            }
            if let Some((first, genesis)) = &members.genesis {
                if *genesis != config.genesis {
                    return Err(ConfigError::GenesisMismatch {
                        node: config.name,
                        first: first.clone(),
                    }
                    .into());
                }
            }
            let network_id = genesis_network_id(&config.genesis)?;
            validate_node(&config, network_id).map_err(|e| ConfigError::InvalidNode {
                node: config.name.clone(),
                source: Box::new(e),
            })?;
            if let Some(backend) = &config.backend {
                if !self.config.binaries.contains_key(backend.node_type()) {
                    return Err(ConfigError::MissingBinary(backend.node_type().to_string()).into());
                }
            }

            let ports = members.allocate_ports(&config, &self.config)?;
            let plan = Planned { config, ports };
            check_local_ports(std::slice::from_ref(&plan))?;
            members.starting.insert(plan.config.name.clone());
            let bootstrap_ips = members.bootstrap_ips(&plan.config.name);
            (plan, bootstrap_ips)
        };

        let name = plan.config.name.clone();
        let is_beacon = plan.config.is_beacon;
        let peer_address = node::peer_address(&plan.config, plan.ports);
        let genesis = plan.config.genesis.clone();
        info!(network = %self.config.name, node = %name, "adding node");

        let started = match self.build_node(plan, bootstrap_ips) {
            Ok(node) => match node.start().await {
                Ok(()) => Ok(node),
                Err(e) => {
                    stop_quietly(&node).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        let mut members = self.members.write().await;
        members.starting.remove(&name);
        let node = started.map_err(|source| Error::Start {
            node: name.clone(),
            source: Box::new(source),
        })?;
        if self.is_stopped() {
            drop(members);
            warn!(node = %name, "network stopped while node was starting");
            stop_quietly(&node).await;
            return Err(Error::NetworkStopped);
        }

        if is_beacon {
            members.beacons.insert(name.clone(), peer_address);
        }
        if members.genesis.is_none() {
            members.genesis = Some((name.clone(), genesis));
        }
        members.nodes.insert(name, node.clone());
        Ok(node)
    }

    /// Stop a node and remove it from the network.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let node = {
            let mut members = self.members.write().await;
            if self.is_stopped() {
                return Err(Error::NetworkStopped);
            }
            let node = members
                .nodes
                .remove(name)
                .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
            members.beacons.remove(name);
            node
        };
        info!(network = %self.config.name, node = %name, "removing node");
        node.stop(Instant::now() + DEFAULT_STOP_TIMEOUT).await
    }

    /// Look up a current member by name.
    pub async fn get_node(&self, name: &str) -> Result<Arc<dyn Node>> {
        let members = self.members.read().await;
        if self.is_stopped() {
            return Err(Error::NetworkStopped);
        }
        members
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Sorted member names, or `None` once the network is stopped.
    pub async fn get_node_names(&self) -> Option<Vec<String>> {
        let members = self.members.read().await;
        if self.is_stopped() {
            return None;
        }
        Some(members.nodes.keys().cloned().collect())
    }

    /// Stop every node and mark the network stopped.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    /// Every node is asked to stop even if others fail, and all failures are
    /// reported together.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let nodes = {
            let mut members = self.members.write().await;
            if self
                .stopped
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            self.shutdown.cancel();
            members.beacons.clear();
            std::mem::take(&mut members.nodes)
        };

        info!(network = %self.config.name, nodes = nodes.len(), "stopping network");
        let deadline = Instant::now() + timeout;
        let results = join_all(
            nodes
                .into_iter()
                .map(|(name, node)| async move { (name, node.stop(deadline).await) }),
        )
        .await;

        let mut errors = StopErrors::default();
        for (name, result) in results {
            if let Err(e) = result {
                error!(node = %name, error = %e, "failed to stop node");
                errors.push(name, e);
            }
        }
        errors.into_result()
    }
}

/// Start `nodes` concurrently. On failure, stop them all and report the first.
async fn start_all(nodes: &[Arc<dyn Node>]) -> Result<()> {
    let results = join_all(nodes.iter().map(|node| async move { (node, node.start().await) })).await;

    let mut first_failure = None;
    for (node, result) in results {
        if let Err(e) = result {
            error!(node = %node.name(), error = %e, "node failed to start");
            first_failure.get_or_insert((node.name().to_string(), e));
        }
    }
    let Some((node, source)) = first_failure else {
        return Ok(());
    };

    warn!("stopping nodes after failed start");
    let deadline = Instant::now() + DEFAULT_STOP_TIMEOUT;
    for (node, result) in join_all(nodes.iter().map(|n| async move { (n, n.stop(deadline).await) })).await {
        if let Err(e) = result {
            warn!(node = %node.name(), error = %e, "failed to stop node");
        }
    }
    Err(Error::Start {
        node,
        source: Box::new(source),
    })
}

async fn stop_quietly(node: &Arc<dyn Node>) {
    if let Err(e) = node.stop(Instant::now() + DEFAULT_STOP_TIMEOUT).await {
        warn!(node = %node.name(), error = %e, "failed to stop node");
    }
}

/// Fail early if a port a local process needs is already bound.
fn check_local_ports(planned: &[Planned]) -> Result<()> {
    let required: Vec<(u16, String)> = planned
        .iter()
        .filter(|plan| matches!(plan.config.backend, Some(BackendConfig::Process(_))))
        .flat_map(|plan| {
            [
                (plan.ports.api, format!("{} API", plan.config.name)),
                (plan.ports.peer, format!("{} peer", plan.config.name)),
            ]
        })
        .collect();
    let busy = ports::unavailable_ports(&required);
    if busy.is_empty() {
        Ok(())
    } else {
        Err(Error::PortsUnavailable(busy))
    }
}
