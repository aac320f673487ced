//! Observable state of the discovery actor.
//!
//! The actor publishes a [`DiscoveryMetrics`] snapshot on a `watch` channel
//! whenever anything notable changes. [`Wait`] wraps the receiver with a
//! timeout for asserting on cluster progress in tests and tooling.

use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::discovery::ClusterState;
use crate::discovery::Role;

/// A snapshot of the discovery actor's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMetrics {
    /// Name of the local node, empty before registration.
    pub node_name: String,
    /// The cluster join state.
    pub state: ClusterState,
    /// The Raft role.
    pub role: Role,
    /// The current Raft term.
    pub current_term: u64,
    /// Index of the last entry in the Raft log.
    pub last_log_index: u64,
    /// The index of the highest log entry known to be committed.
    pub commit_index: u64,
    /// The index of the highest log entry applied to the registry.
    pub last_applied: u64,
    /// Name of the current leader, when known.
    pub current_leader: Option<String>,
    /// Total nodes known to the registry.
    pub total_nodes: usize,
    /// Nodes currently active.
    pub active_nodes: usize,
}

impl DiscoveryMetrics {
    /// The initial snapshot published before the actor has done anything.
    pub fn new_initial() -> Self {
        Self {
            node_name: String::new(),
            state: ClusterState::Reset,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            total_nodes: 0,
            active_nodes: 0,
        }
    }
}

/// A handle for waiting on metrics to satisfy a condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<DiscoveryMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for an observed snapshot.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<DiscoveryMetrics>
    where T: Fn(&DiscoveryMetrics) -> bool {
        let msg = msg.to_string();
        tracing::debug!("waiting for metrics: {}", msg);
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("done waiting for metrics: {}", msg);
                return Ok(latest);
            }
            let delay = timeout(self.timeout, rx.changed()).await;
            match delay {
                Ok(changed) => changed
                    .map_err(|_| anyhow!("metrics channel closed waiting for: {}", msg))?,
                Err(_) => {
                    let latest = rx.borrow().clone();
                    return Err(anyhow!(
                        "timeout after {:?} waiting for: {} (latest: {:?})",
                        self.timeout,
                        msg,
                        latest
                    ));
                }
            }
        }
    }

    /// Wait for the cluster join state to become `want`.
    pub async fn state(&self, want: ClusterState, msg: impl ToString) -> Result<DiscoveryMetrics> {
        self.metrics(|m| m.state == want, format!("{} state -> {:?}", msg.to_string(), want)).await
    }

    /// Wait for the Raft role to become `want`.
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<DiscoveryMetrics> {
        self.metrics(|m| m.role == want, format!("{} role -> {:?}", msg.to_string(), want)).await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<DiscoveryMetrics> {
        self.metrics(|m| m.last_applied >= want, format!("{} applied -> {}", msg.to_string(), want))
            .await
    }

    /// Wait for the leader to become known as `want`.
    pub async fn current_leader(&self, want: impl ToString, msg: impl ToString) -> Result<DiscoveryMetrics> {
        let want = want.to_string();
        self.metrics(
            |m| m.current_leader.as_deref() == Some(want.as_str()),
            format!("{} leader -> {}", msg.to_string(), want),
        )
        .await
    }
}
