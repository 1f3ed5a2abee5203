//! Port allocation for process-backed nodes.

use std::net::TcpListener;

use serde::{Deserialize, Serialize};

/// Default base ports for the node API and peer-to-peer services.
pub const DEFAULT_API_PORT: u16 = 9650;
pub const DEFAULT_PEER_PORT: u16 = 9651;

/// Default offset between nodes for port allocation.
pub const DEFAULT_PORT_OFFSET: u16 = 10;

/// Port allocation strategy for assigning ports to nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocationStrategy {
    /// Base port for the node API.
    pub api_base: u16,
    /// Base port for peer-to-peer traffic.
    pub peer_base: u16,
    /// Offset between consecutive nodes.
    pub node_offset: u16,
}

impl Default for PortAllocationStrategy {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_PORT,
            peer_base: DEFAULT_PEER_PORT,
            node_offset: DEFAULT_PORT_OFFSET,
        }
    }
}

impl PortAllocationStrategy {
    /// Allocate ports for a node at the given index.
    ///
    /// Returns `None` if the index would push a port past `u16::MAX`.
    pub fn allocate(&self, node_index: usize) -> Option<NodePorts> {
        let index = u16::try_from(node_index).ok()?;
        let offset = index.checked_mul(self.node_offset)?;
        Some(NodePorts {
            api: self.api_base.checked_add(offset)?,
            peer: self.peer_base.checked_add(offset)?,
        })
    }
}

/// All ports allocated to a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    /// Node API port (default 9650).
    pub api: u16,
    /// Peer-to-peer port (default 9651).
    pub peer: u16,
}

/// Check that all specified ports are available on localhost.
///
/// Binds each port and releases it immediately. The port can still be taken
/// between this check and the node binding it, so this only catches most
/// conflicts early.
///
/// Returns the `(port, description)` entries that could not be bound.
pub fn unavailable_ports(ports: &[(u16, String)]) -> Vec<(u16, String)> {
    ports
        .iter()
        .filter(|(port, _)| TcpListener::bind(("127.0.0.1", *port)).is_err())
        .cloned()
        .collect()
}
