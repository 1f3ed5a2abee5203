//! Error types for netrunner.

use std::fmt;

use thiserror::Error;

use crate::client::ClientError;
use crate::controller::ControllerError;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which staking credential was missing from a node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    StakingKey,
    StakingCert,
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StakingKey => f.write_str("staking key"),
            Self::StakingCert => f.write_str("staking certificate"),
        }
    }
}

/// Malformed or inconsistent configuration.
///
/// Always fatal to the operation that detected it and never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("backend-specific node config not given")]
    MissingBackendConfig,

    #[error("{0} not given")]
    MissingCredential(Credential),

    #[error("could not parse config overlay: {0}")]
    MalformedOverlay(String),

    #[error("wrong type for field {field:?} in config overlay: expected {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    #[error("config overlay network id {overlay} differs from genesis network id {genesis}")]
    NetworkIdMismatch { overlay: u64, genesis: u32 },

    #[error("could not read network id from genesis: {0}")]
    MalformedGenesis(String),

    #[error("node {node} genesis differs from genesis of {first}")]
    GenesisMismatch { node: String, first: String },

    #[error("node name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("at least one node must be a beacon")]
    NoBeacon,

    #[error("no binary or image configured for node type {0:?}")]
    MissingBinary(String),

    #[error("node {node} config failed validation: {source}")]
    InvalidNode {
        node: String,
        #[source]
        source: Box<ConfigError>,
    },
}

/// Errors surfaced by the network lifecycle manager and its nodes.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node {node} failed to start: {source}")]
    Start {
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Stop(#[from] StopErrors),

    #[error("node {0} did not stop before the deadline")]
    StopTimeout(String),

    #[error("node {node} is unhealthy: {reason}")]
    Unhealthy { node: String, reason: String },

    #[error("timed out waiting for nodes to become healthy: {}", pending.join(", "))]
    HealthTimeout { pending: Vec<String> },

    #[error("network has been stopped")]
    NetworkStopped,

    #[error("no node named {0:?}")]
    NodeNotFound(String),

    #[error("node {0} has not been observed healthy yet")]
    NotReady(String),

    #[error("resource-backed node requested but no resource controller is configured")]
    NoController,

    #[error("no ports left to allocate for node {0}")]
    PortsExhausted(String),

    #[error("ports already in use: {}", format_ports(.0))]
    PortsUnavailable(Vec<(u16, String)>),

    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_ports(ports: &[(u16, String)]) -> String {
    ports
        .iter()
        .map(|(port, what)| format!("{port} ({what})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-node failures collected while stopping a set of nodes.
///
/// Stopping is best-effort: one node's failure never prevents the others from
/// being stopped, so every failure is kept rather than only the first.
#[derive(Debug, Default, Error)]
pub struct StopErrors {
    errors: Vec<(String, Error)>,
}

impl StopErrors {
    pub fn push(&mut self, node: impl Into<String>, error: Error) {
        self.errors.push((node.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.errors.iter().map(|(node, error)| (node.as_str(), error))
    }

    /// `Ok(())` if nothing failed, otherwise the combined error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Stop(self))
        }
    }
}

impl fmt::Display for StopErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to stop {} node(s)", self.errors.len())?;
        for (node, error) in &self.errors {
            write!(f, "; {node}: {error}")?;
        }
        Ok(())
    }
}
