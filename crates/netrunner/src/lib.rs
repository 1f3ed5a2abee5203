//! netrunner: provision, supervise and tear down validator test networks.
//!
//! A [`Network`] owns a set of nodes described by a [`NetworkConfig`]. Each
//! node runs either as a local process or as a cluster resource managed by an
//! external operator; the manager drives both the same way through the
//! [`Node`] trait.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use netrunner::{Backends, Network, NetworkConfig};
//!
//! # async fn run() -> netrunner::Result<()> {
//! let config = NetworkConfig::from_file("network.json")?;
//! let network = Network::new(config, Backends::default()).await?;
//! network.healthy().await?;
//!
//! for name in network.get_node_names().await.unwrap_or_default() {
//!     let node = network.get_node(&name).await?;
//!     println!("{name}: {}", node.identity().await?);
//! }
//!
//! network.stop(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod health;
pub mod network;
pub mod node;
pub mod ports;
pub mod validate;

pub use client::{ApiClient, ChainClient, ClientFactory, HttpClientFactory, NodeClient, NodeId};
pub use config::{BackendConfig, BackendKind, NetworkConfig, NodeConfig};
pub use controller::{KubeController, ResourceController};
pub use error::{ConfigError, Error, Result, StopErrors};
pub use network::Network;
pub use node::{Backends, HealthCheckError, Node, NodeState};
pub use ports::{NodePorts, PortAllocationStrategy};
