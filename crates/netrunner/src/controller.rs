//! Cluster resource management for resource-backed nodes.
//!
//! A resource-backed node is declared as a namespaced custom resource; an
//! external operator turns that declaration into a running node and reports
//! progress in the resource's status.

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "netrunner";

const NOT_FOUND: u16 = 404;

/// Identifies one declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
    /// `group/version`, or just `version` for the core group.
    pub api_version: String,
    pub kind: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}/{}", self.api_version, self.kind, self.namespace, self.name)
    }
}

/// Desired state of a resource-backed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResource {
    #[serde(flatten)]
    pub reference: ResourceRef,
    pub spec: NodeResourceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceSpec {
    pub image: String,
    pub node_type: String,
    pub network: String,
    pub api_port: u16,
    pub peer_port: u16,
    pub is_beacon: bool,
    pub bootstrap_ips: Vec<String>,
    pub log_level: String,
    /// Base64 (standard alphabet), as in a secret's `data`.
    pub staking_key: String,
    /// Base64 (standard alphabet), as in a secret's `data`.
    pub staking_cert: String,
    pub genesis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_config_file: Option<String>,
}

/// Lifecycle phase reported by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePhase {
    Pending,
    Running,
    Failed,
}

impl ResourcePhase {
    /// Unrecognised phases are treated as still in progress.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Running" => Self::Running,
            "Failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub phase: ResourcePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceStatus {
    /// Read a status from the `status` stanza of a resource, if it has one.
    pub fn from_status_value(status: &Value) -> Option<Self> {
        let phase = status.get("phase")?.as_str()?;
        Some(Self {
            phase: ResourcePhase::parse(phase),
            message: status
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid resource {resource}: {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error("cluster API rejected request for {resource}: {source}")]
    Api {
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error("could not connect to cluster: {0}")]
    Connect(#[source] kube::Error),
}

/// The cluster capability resource-backed nodes are driven through.
///
/// Every method returns once the cluster has accepted the request, without
/// waiting for the operator to act on it.
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Create the resource or update it to match `resource`.
    async fn apply(&self, resource: &NodeResource) -> Result<(), ControllerError>;

    /// Delete the resource. Deleting a resource that does not exist succeeds.
    async fn delete(&self, resource: &ResourceRef) -> Result<(), ControllerError>;

    /// Current status, or `None` if the resource does not exist.
    ///
    /// A resource the operator has not reported on yet is `Pending`.
    async fn status(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ControllerError>;
}

/// [`ResourceController`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeController {
    client: kube::Client,
}

impl KubeController {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration.
    pub async fn try_default() -> Result<Self, ControllerError> {
        let client = kube::Client::try_default()
            .await
            .map_err(ControllerError::Connect)?;
        Ok(Self::new(client))
    }

    fn api(&self, resource: &ResourceRef) -> Result<(Api<DynamicObject>, ApiResource), ControllerError> {
        let api_resource = api_resource(resource)?;
        let api = Api::namespaced_with(self.client.clone(), &resource.namespace, &api_resource);
        Ok((api, api_resource))
    }
}

fn api_resource(resource: &ResourceRef) -> Result<ApiResource, ControllerError> {
    let (group, version) = match resource.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", resource.api_version.as_str()),
    };
    if version.is_empty() || resource.kind.is_empty() {
        return Err(ControllerError::InvalidResource {
            resource: resource.to_string(),
            reason: "apiVersion and kind must be set".to_string(),
        });
    }
    let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
    Ok(ApiResource::from_gvk(&gvk))
}

fn api_error(resource: &ResourceRef, source: kube::Error) -> ControllerError {
    ControllerError::Api {
        resource: resource.to_string(),
        source,
    }
}

#[async_trait]
impl ResourceController for KubeController {
    async fn apply(&self, resource: &NodeResource) -> Result<(), ControllerError> {
        let reference = &resource.reference;
        let (api, api_resource) = self.api(reference)?;
        let spec = serde_json::to_value(&resource.spec).map_err(|e| ControllerError::InvalidResource {
            resource: reference.to_string(),
            reason: e.to_string(),
        })?;
        let object = DynamicObject::new(&reference.name, &api_resource)
            .within(&reference.namespace)
            .data(json!({ "spec": spec }));

        debug!(resource = %reference, "applying node resource");
        api.patch(
            &reference.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await
        .map_err(|e| api_error(reference, e))?;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ControllerError> {
        let (api, _) = self.api(resource)?;
        debug!(resource = %resource, "deleting node resource");
        match api.delete(&resource.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == NOT_FOUND => {
                debug!(resource = %resource, "node resource already gone");
                Ok(())
            }
            Err(e) => Err(api_error(resource, e)),
        }
    }

    async fn status(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ControllerError> {
        let (api, _) = self.api(resource)?;
        let Some(object) = api
            .get_opt(&resource.name)
            .await
            .map_err(|e| api_error(resource, e))?
        else {
            return Ok(None);
        };
        let status = object
            .data
            .get("status")
            .and_then(ResourceStatus::from_status_value)
            .unwrap_or(ResourceStatus {
                phase: ResourcePhase::Pending,
                message: None,
            });
        Ok(Some(status))
    }
}
