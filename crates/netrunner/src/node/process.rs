//! Nodes run as local OS processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{HealthCheckError, Node, NodeContext, NodeCore, NodeState, classify};
use crate::client::{Endpoint, NodeClient, NodeId};
use crate::config::{BackendKind, NodeConfig, keys};
use crate::error::{Error, Result};
use crate::ports::NodePorts;

const STAKING_KEY_FILE: &str = "staking.key";
const STAKING_CERT_FILE: &str = "staking.crt";
const GENESIS_FILE: &str = "genesis.json";
const CONFIG_FILE: &str = "config.json";
const CHAIN_CONFIG_FILE: &str = "chain-config.json";
const DB_DIR: &str = "db";
const LOG_DIR: &str = "logs";

/// A node spawned from a local binary.
///
/// Everything the node needs is written under its home directory before
/// launch; its stdout and stderr are forwarded to the log.
pub struct ProcessNode {
    core: NodeCore,
    config: NodeConfig,
    binary: PathBuf,
    home: PathBuf,
    ports: NodePorts,
    log_level: String,
    bootstrap_ips: Vec<String>,
    grace_period: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessNode {
    pub fn new(config: NodeConfig, binary: &str, ctx: &NodeContext<'_>) -> Result<Self> {
        let client = ctx.backends.clients.client(&Endpoint::localhost(ctx.ports.api))?;
        Ok(Self {
            core: NodeCore::new(config.name.clone(), client),
            home: ctx.root_dir.join(&config.name),
            binary: PathBuf::from(binary),
            ports: ctx.ports,
            log_level: ctx.log_level.to_string(),
            bootstrap_ips: ctx.bootstrap_ips.clone(),
            grace_period: ctx.stop_grace_period,
            child: Mutex::new(None),
            config,
        })
    }

    /// The node's overlay with everything the harness controls filled in.
    ///
    /// Ports always reflect the resolved allocation; storage and log paths
    /// default to the home directory; a configured `network-id` is kept as is.
    fn launch_overlay(&self) -> Result<Map<String, Value>> {
        let mut overlay = self.config.overlay()?.unwrap_or_default();
        overlay.insert(keys::HTTP_PORT.to_string(), self.ports.api.into());
        overlay.insert(keys::STAKING_PORT.to_string(), self.ports.peer.into());
        for (key, dir) in [(keys::DB_DIR, DB_DIR), (keys::LOG_DIR, LOG_DIR)] {
            overlay
                .entry(key)
                .or_insert_with(|| self.home.join(dir).to_string_lossy().into_owned().into());
        }
        Ok(overlay)
    }

    /// Write the node's files and return the launch arguments.
    async fn prepare(&self) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.home).await?;

        let path = |file: &str| self.home.join(file).to_string_lossy().into_owned();
        tokio::fs::write(path(STAKING_KEY_FILE), &self.config.staking_key).await?;
        tokio::fs::write(path(STAKING_CERT_FILE), &self.config.staking_cert).await?;
        tokio::fs::write(path(GENESIS_FILE), &self.config.genesis).await?;
        let overlay = serde_json::to_vec_pretty(&self.launch_overlay()?)?;
        tokio::fs::write(path(CONFIG_FILE), overlay).await?;

        let mut args = vec![
            format!("--config-file={}", path(CONFIG_FILE)),
            format!("--genesis={}", path(GENESIS_FILE)),
            format!("--staking-tls-key-file={}", path(STAKING_KEY_FILE)),
            format!("--staking-tls-cert-file={}", path(STAKING_CERT_FILE)),
        ];
        if let Some(chain_config) = &self.config.chain_config_file {
            tokio::fs::write(path(CHAIN_CONFIG_FILE), chain_config).await?;
            args.push(format!("--chain-config-file={}", path(CHAIN_CONFIG_FILE)));
        }
        args.extend([
            format!("--http-port={}", self.ports.api),
            format!("--staking-port={}", self.ports.peer),
            format!("--log-level={}", self.log_level),
            format!("--bootstrap-ips={}", self.bootstrap_ips.join(",")),
        ]);
        Ok(args)
    }

    async fn spawn(&self, args: &[String]) -> Result<Child> {
        info!(node = %self.core.name(), binary = %self.binary.display(), "starting node process");
        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let name = self.core.name().to_string();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(name.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name, "stderr", stderr));
        }
        Ok(child)
    }
}

#[async_trait]
impl Node for ProcessNode {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Process
    }

    fn state(&self) -> NodeState {
        self.core.state()
    }

    fn client(&self) -> std::sync::Arc<dyn NodeClient> {
        self.core.client()
    }

    async fn start(&self) -> Result<()> {
        self.core.begin_start()?;
        let launched = match self.prepare().await {
            Ok(args) => self.spawn(&args).await,
            Err(e) => Err(e),
        };
        match launched {
            Ok(child) => {
                let mut slot = self.child.lock().await;
                if self.core.state() == NodeState::Stopped {
                    // Stopped while launching; `child` is killed on drop.
                    return Err(Error::NetworkStopped);
                }
                *slot = Some(child);
                Ok(())
            }
            Err(e) => {
                self.core.fail();
                Err(e)
            }
        }
    }

    async fn stop(&self, deadline: Instant) -> Result<()> {
        self.core.mark_stopped();
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        let name = self.core.name();
        let grace = (Instant::now() + self.grace_period).min(deadline);
        if terminate(&child) {
            debug!(node = %name, "sent SIGTERM to node process");
            if let Ok(status) = tokio::time::timeout_at(grace, child.wait()).await {
                let status = status?;
                debug!(node = %name, %status, "node process exited");
                return Ok(());
            }
            warn!(node = %name, "node process did not exit in time, killing it");
        }
        child.kill().await?;
        Ok(())
    }

    async fn health(&self) -> std::result::Result<bool, HealthCheckError> {
        let exited = match self.child.lock().await.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("node process exited with {status}")),
                Ok(None) => None,
                Err(e) => Some(format!("could not query node process: {e}")),
            },
            None if self.core.state() == NodeState::Created => return Ok(false),
            None => Some("node process is not running".to_string()),
        };
        let probe = match exited {
            Some(reason) => Err(HealthCheckError::Terminal(reason)),
            None => self.core.client().health().await.map_err(classify),
        };
        self.core.observe(probe)
    }

    async fn identity(&self) -> Result<NodeId> {
        self.core.identity().await
    }
}

/// Ask the process to shut down. Returns `false` if no signal could be sent.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

async fn forward_output<R: AsyncRead + Unpin>(node: String, stream: &'static str, output: R) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(node = %node, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(node = %node, stream, error = %e, "stopped reading node output");
                break;
            }
        }
    }
}
