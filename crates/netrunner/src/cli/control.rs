//! Control subcommands for a running network.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::eyre::{Context, Result};

use super::{DEFAULT_ENDPOINT, Run};
use netrunner::NodeConfig;
use netrunner::control::ControlClient;

#[derive(clap::Args)]
pub struct Control {
    /// Control server URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Seconds to wait for the server to answer. Waiting for health can take
    /// as long as the network's health timeout.
    #[arg(long, default_value = "300")]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: ControlCommand,
}

#[derive(clap::Subcommand)]
pub enum ControlCommand {
    /// List node names.
    Nodes,
    /// Show one node.
    Node {
        name: String,
    },
    /// Add a node from a JSON node config.
    AddNode {
        /// File holding the node config.
        #[arg(long)]
        config: PathBuf,
    },
    /// Stop and remove a node.
    RemoveNode {
        name: String,
    },
    /// Wait until every node is healthy.
    Health,
    /// Stop the network.
    Stop,
}

impl Run for Control {
    async fn run(self) -> Result<()> {
        let client = ControlClient::new(&self.endpoint, Duration::from_secs(self.timeout))?;
        match self.command {
            ControlCommand::Nodes => {
                for name in client.node_names().await? {
                    println!("{name}");
                }
            }
            ControlCommand::Node { name } => {
                let node = client.node(&name).await?;
                println!("{}", serde_json::to_string_pretty(&node)?);
            }
            ControlCommand::AddNode { config } => {
                let json = std::fs::read_to_string(&config)
                    .wrap_err_with(|| format!("failed to read node config from {config:?}"))?;
                let node: NodeConfig =
                    serde_json::from_str(&json).wrap_err("failed to parse node config")?;
                let name = client.add_node(&node).await?;
                println!("added {name}");
            }
            ControlCommand::RemoveNode { name } => {
                client.remove_node(&name).await?;
                println!("removed {name}");
            }
            ControlCommand::Health => {
                client.health().await?;
                println!("network is healthy");
            }
            ControlCommand::Stop => {
                client.stop().await?;
                println!("network stopped");
            }
        }
        Ok(())
    }
}
