//! Readiness aggregation across a set of nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::node::{HealthCheckError, Node};

/// Wait until every node in `nodes` reports healthy.
///
/// Each node is polled every `interval` by its own task. The first terminal
/// failure wins and ends the wait; so does `timeout` elapsing or `shutdown`
/// being cancelled. No poller outlives this call.
pub async fn wait_healthy(
    nodes: Vec<Arc<dyn Node>>,
    interval: Duration,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let cancel = shutdown.child_token();
    let _cancel_on_return = cancel.clone().drop_guard();

    let mut pending = BTreeSet::new();
    let mut names = HashMap::new();
    let mut pollers = JoinSet::new();
    for node in nodes {
        let name = node.name().to_string();
        let handle = pollers.spawn(poll_node(node, interval, cancel.clone()));
        names.insert(handle.id(), name.clone());
        pending.insert(name);
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::NetworkStopped),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::HealthTimeout {
                    pending: pending.into_iter().collect(),
                });
            }
            joined = pollers.join_next() => match joined {
                None => {
                    info!("all nodes healthy");
                    return Ok(());
                }
                Some(Ok((name, Ok(())))) => {
                    debug!(node = %name, remaining = pending.len().saturating_sub(1), "node healthy");
                    pending.remove(&name);
                }
                Some(Ok((_, Err(e)))) => return Err(e),
                Some(Err(e)) => {
                    let node = names.get(&e.id()).cloned().unwrap_or_default();
                    return Err(Error::Unhealthy {
                        node,
                        reason: format!("health poller failed: {e}"),
                    });
                }
            },
        }
    }
}

async fn poll_node(
    node: Arc<dyn Node>,
    interval: Duration,
    cancel: CancellationToken,
) -> (String, Result<()>) {
    let name = node.name().to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        let probe = tokio::select! {
            _ = cancel.cancelled() => break Err(Error::NetworkStopped),
            probe = async {
                ticker.tick().await;
                node.health().await
            } => probe,
        };
        match probe {
            Ok(true) => break Ok(()),
            Ok(false) => trace!(node = %name, "node not healthy yet"),
            Err(HealthCheckError::Transient(reason)) => {
                debug!(node = %name, %reason, "health check failed, retrying");
            }
            Err(HealthCheckError::Terminal(reason)) => {
                break Err(Error::Unhealthy {
                    node: name.clone(),
                    reason,
                });
            }
        }
    };
    (name, result)
}
