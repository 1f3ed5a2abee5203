//! Nodes declared as cluster resources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{HealthCheckError, Node, NodeContext, NodeCore, NodeState, classify};
use crate::client::{Endpoint, NodeClient, NodeId};
use crate::config::{BackendKind, NodeConfig, ResourceConfig};
use crate::controller::{
    NodeResource, NodeResourceSpec, ResourceController, ResourcePhase, ResourceRef,
};
use crate::error::{ConfigError, Error, Result};

/// Bound on the delete issued when a stop overtakes an in-flight apply.
const DELETE_AFTER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// In-cluster DNS name of a node's service.
pub fn service_host(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.svc")
}

/// A node run by an external operator from a declared resource.
pub struct ResourceNode {
    core: NodeCore,
    resource: NodeResource,
    controller: Arc<dyn ResourceController>,
}

impl ResourceNode {
    pub fn new(
        config: NodeConfig,
        backend: &ResourceConfig,
        image: &str,
        controller: Arc<dyn ResourceController>,
        ctx: &NodeContext<'_>,
    ) -> Result<Self> {
        let endpoint = Endpoint::new(service_host(&config.name, &backend.namespace), ctx.ports.api);
        let client = ctx.backends.clients.client(&endpoint)?;
        let genesis = String::from_utf8(config.genesis.clone())
            .map_err(|e| ConfigError::MalformedGenesis(e.to_string()))?;

        let resource = NodeResource {
            reference: ResourceRef {
                name: config.name.clone(),
                namespace: backend.namespace.clone(),
                api_version: backend.api_version.clone(),
                kind: backend.kind.clone(),
            },
            spec: NodeResourceSpec {
                image: image.to_string(),
                node_type: backend.node_type.clone(),
                network: ctx.network.to_string(),
                api_port: ctx.ports.api,
                peer_port: ctx.ports.peer,
                is_beacon: config.is_beacon,
                bootstrap_ips: ctx.bootstrap_ips.clone(),
                log_level: ctx.log_level.to_string(),
                staking_key: STANDARD.encode(&config.staking_key),
                staking_cert: STANDARD.encode(&config.staking_cert),
                genesis,
                config_file: config.config_file.clone(),
                chain_config_file: config.chain_config_file.clone(),
            },
        };

        Ok(Self {
            core: NodeCore::new(config.name, client),
            resource,
            controller,
        })
    }

    async fn delete(&self, deadline: Instant) -> Result<()> {
        debug!(node = %self.core.name(), "deleting node resource");
        tokio::time::timeout_at(deadline, self.controller.delete(&self.resource.reference))
            .await
            .map_err(|_| Error::StopTimeout(self.core.name().to_string()))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl Node for ResourceNode {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Resource
    }

    fn state(&self) -> NodeState {
        self.core.state()
    }

    fn client(&self) -> Arc<dyn NodeClient> {
        self.core.client()
    }

    async fn start(&self) -> Result<()> {
        self.core.begin_start()?;
        info!(node = %self.core.name(), resource = %self.resource.reference, "declaring node resource");
        if let Err(e) = self.controller.apply(&self.resource).await {
            self.core.fail();
            return Err(e.into());
        }
        if self.core.state() == NodeState::Stopped {
            // Stopped while applying; the stop's delete may have run first.
            warn!(node = %self.core.name(), "node stopped while its resource was applied");
            if let Err(e) = self.delete(Instant::now() + DELETE_AFTER_STOP_TIMEOUT).await {
                warn!(node = %self.core.name(), error = %e, "failed to delete node resource");
            }
            return Err(Error::NetworkStopped);
        }
        Ok(())
    }

    async fn stop(&self, deadline: Instant) -> Result<()> {
        match self.core.mark_stopped() {
            // Never applied, or already deleted.
            NodeState::Created | NodeState::Stopped => Ok(()),
            _ => self.delete(deadline).await,
        }
    }

    async fn health(&self) -> std::result::Result<bool, HealthCheckError> {
        let probe = match self.controller.status(&self.resource.reference).await {
            Err(e) => Err(HealthCheckError::Transient(e.to_string())),
            Ok(None) if self.core.state() == NodeState::Created => Ok(false),
            Ok(None) => Err(HealthCheckError::Terminal(
                "node resource no longer exists".to_string(),
            )),
            Ok(Some(status)) => match status.phase {
                ResourcePhase::Pending => Ok(false),
                ResourcePhase::Failed => Err(HealthCheckError::Terminal(
                    status
                        .message
                        .unwrap_or_else(|| "node resource failed".to_string()),
                )),
                ResourcePhase::Running => self.core.client().health().await.map_err(classify),
            },
        };
        self.core.observe(probe)
    }

    async fn identity(&self) -> Result<NodeId> {
        self.core.identity().await
    }
}
