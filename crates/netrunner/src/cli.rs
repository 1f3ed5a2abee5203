//! CLI command definitions for netrunner.

use clap::Parser;
use std::future::Future;

mod control;
mod ping;
mod server;

/// CLI options for netrunner.
#[derive(Parser)]
#[command(name = "netrunner")]
#[command(about = "Run validator test networks on local processes or cluster resources")]
pub enum Options {
    /// Start a network and serve its control API until stopped.
    Server(server::Server),
    /// Check that a control server is up.
    Ping(ping::Ping),
    /// Inspect or change a running network through its control server.
    Control(control::Control),
}

/// Trait for running CLI commands.
pub trait Run {
    fn run(self) -> impl Future<Output = color_eyre::Result<()>> + Send;
}

impl Run for Options {
    async fn run(self) -> color_eyre::Result<()> {
        match self {
            Self::Server(cmd) => cmd.run().await,
            Self::Ping(cmd) => cmd.run().await,
            Self::Control(cmd) => cmd.run().await,
        }
    }
}

/// Default address of the control server.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";
