//! Node and network configuration.
//!
//! A network is described by a JSON document. Overlay configuration files are
//! carried as JSON-encoded *strings* inside that document, so reading one takes
//! two decoding steps: the document itself, then the overlay string.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, Result};
use crate::ports::PortAllocationStrategy;

/// Overlay keys with a known meaning and an expected primitive type.
pub mod keys {
    pub const NETWORK_ID: &str = "network-id";
    pub const DB_DIR: &str = "db-dir";
    pub const LOG_DIR: &str = "log-dir";
    pub const HTTP_PORT: &str = "http-port";
    pub const STAKING_PORT: &str = "staking-port";
}

pub const DEFAULT_NETWORK_NAME: &str = "netrunner";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_RESOURCE_API_VERSION: &str = "chain.netrunner.dev/v1alpha1";
pub const DEFAULT_RESOURCE_KIND: &str = "Node";

/// Default interval between health polls of a single node.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// Default bound on how long `Network::healthy` waits.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(300);
/// Default time a process-backed node gets to exit after SIGTERM.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The deployment mechanism behind a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Spawned and supervised as a local OS process.
    Process,
    /// Declared as a cluster custom resource and run by an external controller.
    Resource,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Resource => f.write_str("resource"),
        }
    }
}

/// Backend-specific node settings; the `type` tag selects the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Process(ProcessConfig),
    Resource(ResourceConfig),
}

impl BackendConfig {
    /// Key into the network's binary/image map.
    pub fn node_type(&self) -> &str {
        match self {
            Self::Process(config) => &config.node_type,
            Self::Resource(config) => &config.node_type,
        }
    }
}

/// Settings for a process-backed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    /// Selects the binary from [`NetworkConfig::binaries`].
    pub node_type: String,
    /// API port; allocated from the port strategy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
    /// Peer (staking) port; allocated from the port strategy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_port: Option<u16>,
}

/// Settings for a resource-backed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub namespace: String,
    /// Selects the container image from [`NetworkConfig::binaries`].
    pub node_type: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
}

fn default_api_version() -> String {
    DEFAULT_RESOURCE_API_VERSION.to_string()
}

fn default_kind() -> String {
    DEFAULT_RESOURCE_KIND.to_string()
}

/// Configuration of a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Unique within a network. Empty means a name is assigned on creation.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendConfig>,
    /// Other nodes use beacon nodes to bootstrap.
    #[serde(default)]
    pub is_beacon: bool,
    #[serde(default, with = "text_bytes")]
    pub staking_key: Vec<u8>,
    #[serde(default, with = "text_bytes")]
    pub staking_cert: Vec<u8>,
    /// Must be byte-identical across a network.
    #[serde(default, with = "text_bytes")]
    pub genesis: Vec<u8>,
    /// JSON object encoded as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_config_file: Option<String>,
}

impl NodeConfig {
    /// Decode the overlay configuration, if any.
    pub fn overlay(&self) -> std::result::Result<Option<Map<String, Value>>, ConfigError> {
        match self.config_file.as_deref() {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => parse_overlay(raw).map(Some),
        }
    }
}

/// Configuration of a whole network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default = "default_network_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub node_configs: Vec<NodeConfig>,
    /// Binary paths (process backend) or images (resource backend) by node type.
    #[serde(default)]
    pub binaries: BTreeMap<String, String>,
    /// Where process-backed nodes keep their files; a temporary directory if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    #[serde(default = "default_health_check_interval", with = "millis")]
    pub health_check_interval: Duration,
    #[serde(default = "default_health_check_timeout", with = "millis")]
    pub health_check_timeout: Duration,
    /// How long a process-backed node gets to exit after SIGTERM before it
    /// is killed. The stop deadline still bounds the wait.
    #[serde(default = "default_stop_grace_period", with = "millis")]
    pub stop_grace_period: Duration,
    #[serde(default)]
    pub port_strategy: PortAllocationStrategy,
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_health_check_interval() -> Duration {
    DEFAULT_HEALTH_CHECK_INTERVAL
}

fn default_health_check_timeout() -> Duration {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}

fn default_stop_grace_period() -> Duration {
    DEFAULT_STOP_GRACE_PERIOD
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: default_network_name(),
            log_level: default_log_level(),
            node_configs: Vec::new(),
            binaries: BTreeMap::new(),
            root_dir: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            port_strategy: PortAllocationStrategy::default(),
        }
    }
}

/// The on-disk network document: a [`NetworkConfig`] plus network-wide
/// genesis and overlays that are pushed down into every node.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkDocument {
    #[serde(flatten)]
    config: NetworkConfig,
    #[serde(default, with = "text_bytes")]
    genesis: Vec<u8>,
    #[serde(default)]
    config_file: Option<String>,
    #[serde(default)]
    chain_config_file: Option<String>,
}

impl NetworkConfig {
    /// Parse a network document.
    ///
    /// Nodes without their own genesis or chain config inherit the
    /// network-wide one. The shared overlay is merged under each node's own
    /// overlay, node keys taking precedence.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: NetworkDocument = serde_json::from_str(json)?;
        let shared_overlay = match document.config_file.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(parse_overlay(raw)?),
            _ => None,
        };

        let mut config = document.config;
        for node in &mut config.node_configs {
            if node.genesis.is_empty() {
                node.genesis = document.genesis.clone();
            }
            if node.chain_config_file.is_none() {
                node.chain_config_file = document.chain_config_file.clone();
            }
            if let Some(shared) = &shared_overlay {
                merge_shared_overlay(node, shared)?;
            }
        }
        Ok(config)
    }

    /// Read and parse a network document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

fn merge_shared_overlay(node: &mut NodeConfig, shared: &Map<String, Value>) -> Result<()> {
    let merged = match node.overlay() {
        Ok(Some(own)) => {
            let mut merged = shared.clone();
            merged.extend(own);
            merged
        }
        Ok(None) => shared.clone(),
        // Leave a malformed node overlay alone so validation names the node.
        Err(_) => return Ok(()),
    };
    node.config_file = Some(serde_json::to_string(&merged)?);
    Ok(())
}

fn parse_overlay(raw: &str) -> std::result::Result<Map<String, Value>, ConfigError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ConfigError::MalformedOverlay(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(ConfigError::MalformedOverlay(e.to_string())),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Opaque byte blobs in JSON documents.
///
/// UTF-8 content (PEM keys, genesis JSON) is carried as a plain string; any
/// other content as `{"base64": "..."}`. Both forms are accepted on input.
mod text_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        Text(T),
        Base64 { base64: T },
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Repr::Text(text).serialize(serializer),
            Err(_) => Repr::Base64 {
                base64: STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Repr::<String>::deserialize(deserializer)? {
            Repr::Text(text) => Ok(text.into_bytes()),
            Repr::Base64 { base64 } => STANDARD.decode(base64).map_err(serde::de::Error::custom),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
