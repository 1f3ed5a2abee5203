//! HTTP control plane for a running network.
//!
//! `netrunner server` hosts one [`Network`] behind [`router`]; `netrunner
//! ping` and `netrunner control` talk to it through [`ControlClient`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BackendKind, NodeConfig};
use crate::error::Error;
use crate::network::{DEFAULT_STOP_TIMEOUT, Network};
use crate::node::NodeState;

/// Answer to `GET /ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Process id of the server.
    pub pid: u32,
}

/// Answer to `GET /nodes/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    /// Lifecycle state as of the request.
    pub state: NodeState,
    pub backend: BackendKind,
    /// Only known once the node has been healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Answer to `POST /nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedNode {
    /// The node's name, assigned by the network if the request left it empty.
    pub name: String,
}

/// Answer to `GET /health` when every node is healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
}

/// Body of every non-success response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The error, rendered for humans.
    pub message: String,
}

/// Control routes over a shared network.
pub fn router(network: Arc<Network>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/nodes", get(list_nodes).post(add_node))
        .route("/nodes/{name}", get(get_node).delete(remove_node))
        .route("/health", get(health))
        .route("/stop", post(stop))
        .with_state(network)
}

/// A library error rendered as an HTTP response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
        Error::NetworkStopped => StatusCode::CONFLICT,
        Error::Config(_) | Error::PortsUnavailable(_) => StatusCode::BAD_REQUEST,
        Error::Unhealthy { .. } | Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Start { source, .. } => match source.as_ref() {
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "control request failed");
        }
        (
            status,
            Json(ErrorResponse {
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        pid: std::process::id(),
    })
}

async fn list_nodes(State(network): State<Arc<Network>>) -> Result<Json<Vec<String>>, ApiError> {
    network
        .get_node_names()
        .await
        .map(Json)
        .ok_or(ApiError(Error::NetworkStopped))
}

async fn get_node(
    State(network): State<Arc<Network>>,
    Path(name): Path<String>,
) -> Result<Json<NodeInfo>, ApiError> {
    let node = network.get_node(&name).await?;
    let node_id = node.identity().await.ok().map(|id| id.to_string());
    Ok(Json(NodeInfo {
        name: node.name().to_string(),
        state: node.state(),
        backend: node.backend(),
        node_id,
    }))
}

async fn add_node(
    State(network): State<Arc<Network>>,
    Json(config): Json<NodeConfig>,
) -> Result<(StatusCode, Json<AddedNode>), ApiError> {
    let node = network.add_node(config).await?;
    info!(node = %node.name(), "node added over control API");
    Ok((
        StatusCode::CREATED,
        Json(AddedNode {
            name: node.name().to_string(),
        }),
    ))
}

async fn remove_node(
    State(network): State<Arc<Network>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    network.remove_node(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(network): State<Arc<Network>>) -> Result<Json<HealthResponse>, ApiError> {
    network.healthy().await?;
    Ok(Json(HealthResponse { healthy: true }))
}

async fn stop(State(network): State<Arc<Network>>) -> Result<StatusCode, ApiError> {
    network.stop(DEFAULT_STOP_TIMEOUT).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not reach control server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control server answered HTTP {status}: {message}")]
    Server { status: u16, message: String },
}

/// Client for a control server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// `endpoint` is a base URL such as `http://127.0.0.1:8080`.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn ping(&self) -> Result<PingResponse, ControlError> {
        read_json(self.http.get(self.url("/ping")).send().await?).await
    }

    pub async fn node_names(&self) -> Result<Vec<String>, ControlError> {
        read_json(self.http.get(self.url("/nodes")).send().await?).await
    }

    pub async fn node(&self, name: &str) -> Result<NodeInfo, ControlError> {
        read_json(self.http.get(self.url(&format!("/nodes/{name}"))).send().await?).await
    }

    pub async fn add_node(&self, config: &NodeConfig) -> Result<String, ControlError> {
        let added: AddedNode =
            read_json(self.http.post(self.url("/nodes")).json(config).send().await?).await?;
        Ok(added.name)
    }

    pub async fn remove_node(&self, name: &str) -> Result<(), ControlError> {
        check(self.http.delete(self.url(&format!("/nodes/{name}"))).send().await?).await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<(), ControlError> {
        let _: HealthResponse = read_json(self.http.get(self.url("/health")).send().await?).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        check(self.http.post(self.url("/stop")).send().await?).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ControlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(ControlError::Server {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ControlError> {
    Ok(check(response).await?.json().await?)
}
