//! Ping command implementation.

use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Context, Result};

use super::{DEFAULT_ENDPOINT, Run};
use netrunner::control::ControlClient;

/// Check that a control server is up.
#[derive(Parser)]
pub struct Ping {
    /// Control server URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Seconds to wait for an answer.
    #[arg(long, default_value = "5")]
    pub timeout: u64,
}

impl Run for Ping {
    async fn run(self) -> Result<()> {
        let client = ControlClient::new(&self.endpoint, Duration::from_secs(self.timeout))?;
        let response = client
            .ping()
            .await
            .wrap_err_with(|| format!("no control server answering at {}", self.endpoint))?;
        println!("control server at {} is up (pid {})", self.endpoint, response.pid);
        Ok(())
    }
}
