//! Server command implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tracing::{error, info, warn};

use super::Run;
use netrunner::control;
use netrunner::{Backends, KubeController, Network, NetworkConfig};

/// Start a network and serve its control API until stopped.
#[derive(Parser)]
pub struct Server {
    /// Network document to start from.
    #[arg(long)]
    pub config: PathBuf,

    /// Binary path or image for a node type, as `<type>=<path>`. Repeatable;
    /// overrides the document's entry for the same type.
    #[arg(long = "bin", value_parser = parse_binary)]
    pub binaries: Vec<(String, String)>,

    /// Directory for node files. A temporary directory is used if not given.
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Address the control API listens on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port the control API listens on.
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Drive resource-backed nodes through the Kubernetes cluster in the
    /// current kubeconfig context.
    #[arg(long)]
    pub kube: bool,

    /// Seconds to wait for the network to become healthy.
    #[arg(long)]
    pub health_timeout: Option<u64>,

    /// Seconds nodes get to shut down on exit.
    #[arg(long, default_value = "30")]
    pub stop_timeout: u64,
}

fn parse_binary(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((node_type, path)) if !node_type.is_empty() && !path.is_empty() => {
            Ok((node_type.to_string(), path.to_string()))
        }
        _ => Err(format!("expected <type>=<path>, got {value:?}")),
    }
}

impl Run for Server {
    async fn run(self) -> Result<()> {
        let mut config = NetworkConfig::from_file(&self.config)
            .wrap_err_with(|| format!("failed to load network config from {:?}", self.config))?;
        config.binaries.extend(self.binaries);
        if self.root_dir.is_some() {
            config.root_dir = self.root_dir;
        }
        if let Some(secs) = self.health_timeout {
            config.health_check_timeout = Duration::from_secs(secs);
        }

        let mut backends = Backends::default();
        if self.kube {
            let controller = KubeController::try_default()
                .await
                .wrap_err("failed to connect to the Kubernetes cluster")?;
            backends = backends.with_controller(Arc::new(controller));
        }

        let network = Arc::new(
            Network::new(config, backends)
                .await
                .wrap_err("failed to start network")?,
        );
        if let Some(names) = network.get_node_names().await {
            info!(network = %network.name(), nodes = ?names, "network started");
        }

        tokio::spawn({
            let network = network.clone();
            async move {
                match network.healthy().await {
                    Ok(()) => info!("network is healthy"),
                    Err(e) => error!(error = %e, "network did not become healthy"),
                }
            }
        });

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("failed to bind control API to {addr}"))?;
        info!(addr = %addr, "serving control API");

        let served = axum::serve(listener, control::router(network.clone()))
            .with_graceful_shutdown(shutdown_signal(network.clone()))
            .await;

        let stopped = network.stop(Duration::from_secs(self.stop_timeout)).await;
        served.wrap_err("control API failed")?;
        stopped.wrap_err("failed to stop network cleanly")
    }
}

/// Resolves on Ctrl+C or once the network is stopped through the API.
async fn shutdown_signal(network: Arc<Network>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            warn!("received Ctrl+C, shutting down");
        }
        _ = network.wait_stopped() => info!("network stopped, shutting down"),
    }
}
