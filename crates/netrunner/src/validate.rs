//! Validation of node and network configuration.
//!
//! Everything here is a pure function of its input: no I/O, no shared state,
//! safe to call from any number of tasks at once.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::{NetworkConfig, NodeConfig, keys};
use crate::error::{ConfigError, Credential};

/// Expected primitive type of a known overlay key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Number,
    String,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::String => "string",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
        }
    }
}

const OVERLAY_SCHEMA: &[(&str, FieldType)] = &[
    (keys::NETWORK_ID, FieldType::Number),
    (keys::DB_DIR, FieldType::String),
    (keys::LOG_DIR, FieldType::String),
    (keys::HTTP_PORT, FieldType::Number),
    (keys::STAKING_PORT, FieldType::Number),
];

/// Validate a single node's configuration.
///
/// Unknown overlay keys are ignored so newer node versions can add settings
/// without breaking older harnesses.
pub fn validate_node(config: &NodeConfig, expected_network_id: u32) -> Result<(), ConfigError> {
    if config.backend.is_none() {
        return Err(ConfigError::MissingBackendConfig);
    }
    if config.staking_key.is_empty() {
        return Err(ConfigError::MissingCredential(Credential::StakingKey));
    }
    if config.staking_cert.is_empty() {
        return Err(ConfigError::MissingCredential(Credential::StakingCert));
    }

    let Some(overlay) = config.overlay()? else {
        return Ok(());
    };

    for (field, expected) in OVERLAY_SCHEMA {
        if let Some(value) = overlay.get(*field) {
            if !expected.matches(value) {
                return Err(ConfigError::TypeMismatch {
                    field,
                    expected: expected.name(),
                });
            }
        }
    }

    if let Some(network_id) = overlay.get(keys::NETWORK_ID).and_then(Value::as_f64) {
        // Compared the way a JSON number would be truncated to a u32 id.
        let overlay_id = network_id as u64;
        if overlay_id != u64::from(expected_network_id) {
            return Err(ConfigError::NetworkIdMismatch {
                overlay: overlay_id,
                genesis: expected_network_id,
            });
        }
    }

    Ok(())
}

/// Validate a network's aggregate configuration.
///
/// Checks, in order: genesis equality across all nodes, explicit name
/// uniqueness, beacon presence, then each node individually.
pub fn validate_network(config: &NetworkConfig) -> Result<(), ConfigError> {
    let nodes = &config.node_configs;
    let Some(first) = nodes.first() else {
        return Ok(());
    };
    let first_name = display_name(first, 0);

    for (index, node) in nodes.iter().enumerate().skip(1) {
        if node.genesis != first.genesis {
            return Err(ConfigError::GenesisMismatch {
                node: display_name(node, index),
                first: first_name,
            });
        }
    }

    let mut seen = HashSet::new();
    for node in nodes.iter().filter(|n| !n.name.is_empty()) {
        if !seen.insert(node.name.as_str()) {
            return Err(ConfigError::DuplicateName(node.name.clone()));
        }
    }

    if !nodes.iter().any(|n| n.is_beacon) {
        return Err(ConfigError::NoBeacon);
    }

    let network_id = genesis_network_id(&first.genesis)?;
    for (index, node) in nodes.iter().enumerate() {
        validate_node(node, network_id).map_err(|e| ConfigError::InvalidNode {
            node: display_name(node, index),
            source: Box::new(e),
        })?;
    }

    Ok(())
}

/// Check that every node's type has a binary or image configured.
pub fn validate_binaries(config: &NetworkConfig) -> Result<(), ConfigError> {
    for node in &config.node_configs {
        if let Some(backend) = &node.backend {
            if !config.binaries.contains_key(backend.node_type()) {
                return Err(ConfigError::MissingBinary(backend.node_type().to_string()));
            }
        }
    }
    Ok(())
}

/// Read the network id a genesis document declares in its `networkID` field.
pub fn genesis_network_id(genesis: &[u8]) -> Result<u32, ConfigError> {
    let value: Value = serde_json::from_slice(genesis)
        .map_err(|e| ConfigError::MalformedGenesis(e.to_string()))?;
    let id = value
        .get("networkID")
        .ok_or_else(|| ConfigError::MalformedGenesis("missing networkID".to_string()))?
        .as_u64()
        .ok_or_else(|| {
            ConfigError::MalformedGenesis("networkID is not an unsigned integer".to_string())
        })?;
    u32::try_from(id)
        .map_err(|_| ConfigError::MalformedGenesis(format!("networkID {id} does not fit in u32")))
}

/// Name used in error messages for a node that may not have one yet.
fn display_name(node: &NodeConfig, index: usize) -> String {
    if node.name.is_empty() {
        index.to_string()
    } else {
        node.name.clone()
    }
}
