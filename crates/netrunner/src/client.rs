//! Node API clients.
//!
//! The harness only needs two things from a running node: whether it reports
//! itself healthy and what its identity is. Everything else goes through
//! [`NodeClient::call`] or a [`ChainClient`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::trace;

/// Default timeout for a single API request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HEALTH_PATH: &str = "/ext/health";
const INFO_PATH: &str = "/ext/info";

/// A node's identity as reported by its info API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ClientError::Decode("empty node id".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

/// Errors from talking to a node's API.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("could not reach node: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("node answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("could not decode node response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Nodes that are still booting refuse connections or answer with error
    /// statuses, so those are transient. A well-formed error or an unreadable
    /// answer is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Timeout | Self::Status { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Unreachable(error.to_string())
        }
    }
}

/// The API surface of a running node that the harness consumes.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Whether the node reports itself healthy.
    async fn health(&self) -> Result<bool, ClientError>;

    /// The node's identity.
    async fn node_id(&self) -> Result<NodeId, ClientError>;

    /// Issue an arbitrary API call against `path`.
    async fn call(&self, path: &str, method: &str, params: Value) -> Result<Value, ClientError>;
}

/// Network location of a node's API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn base_url(&self) -> Result<Url, ClientError> {
        Url::parse(&format!("http://{self}")).map_err(|_| ClientError::InvalidEndpoint(self.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Builds the client used to talk to a node at some endpoint.
pub trait ClientFactory: Send + Sync {
    fn client(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeClient>, ClientError>;
}

/// Produces [`ApiClient`]s.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    pub request_timeout: Duration,
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeClient>, ClientError> {
        Ok(Arc::new(ApiClient::new(endpoint, self.request_timeout)?))
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// JSON-RPC 2.0 client for a node's HTTP API.
///
/// The underlying HTTP client is created on first use, and calls are issued
/// one at a time.
pub struct ApiClient {
    base: Url,
    request_timeout: Duration,
    http: OnceCell<reqwest::Client>,
    in_flight: Mutex<()>,
    next_id: AtomicU64,
}

impl ApiClient {
    pub fn new(endpoint: &Endpoint, request_timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            base: endpoint.base_url()?,
            request_timeout,
            http: OnceCell::new(),
            in_flight: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    async fn http(&self) -> Result<&reqwest::Client, ClientError> {
        self.http
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .timeout(self.request_timeout)
                    .build()
                    .map_err(ClientError::from)
            })
            .await
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("connected", &self.http.initialized())
            .finish()
    }
}

#[async_trait]
impl NodeClient for ApiClient {
    async fn health(&self) -> Result<bool, ClientError> {
        let result = self.call(HEALTH_PATH, "health.health", json!({})).await?;
        result
            .get("healthy")
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::Decode("health response has no healthy flag".to_string()))
    }

    async fn node_id(&self) -> Result<NodeId, ClientError> {
        let result = self.call(INFO_PATH, "info.getNodeID", json!({})).await?;
        result
            .get("nodeID")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("info response has no nodeID".to_string()))?
            .parse()
    }

    async fn call(&self, path: &str, method: &str, params: Value) -> Result<Value, ClientError> {
        let url = self
            .base
            .join(path)
            .map_err(|_| ClientError::InvalidEndpoint(format!("{}{path}", self.base)))?;
        let _guard = self.in_flight.lock().await;
        let http = self.http().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(%url, method, id, "calling node API");
        let response = http
            .post(url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: RpcResponse = response.json().await?;
        match (body.result, body.error) {
            (_, Some(error)) => Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ClientError::Decode(
                "response has neither result nor error".to_string(),
            )),
        }
    }
}

/// A client scoped to one chain hosted by a node.
#[derive(Clone)]
pub struct ChainClient {
    inner: Arc<dyn NodeClient>,
    alias: String,
}

impl ChainClient {
    pub fn new(inner: Arc<dyn NodeClient>, alias: impl Into<String>) -> Self {
        Self {
            inner,
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn path(&self) -> String {
        format!("/ext/bc/{}", self.alias)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.inner.call(&self.path(), method, params).await
    }
}
