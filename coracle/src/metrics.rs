//! Observability surface of a running node.
//!
//! The core publishes a [`NodeMetrics`] payload on every externally
//! observable change over a watch channel. `status()` on the node handle
//! reads the same data, and [`Wait`] turns the channel into awaitable
//! conditions for tests and tooling.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::Role;
use crate::message::ClusterConfig;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// A snapshot of a node's externally observable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// The node's ID.
    pub id: NodeId,
    /// The node's current role.
    pub role: Role,
    /// The node's current term.
    pub current_term: Term,
    /// The index of the node's last log entry.
    pub last_log_index: LogIndex,
    /// The index of the highest entry known committed cluster-wide.
    pub commit_index: LogIndex,
    /// The index of the last entry applied to the state machine.
    pub last_applied: LogIndex,
    /// The node's view of the current leader, if any.
    pub current_leader: Option<NodeId>,
    /// The cluster membership configuration in effect.
    pub configuration: ClusterConfig,
    /// The last log index covered by the node's snapshot, 0 if none.
    pub snapshot_last_index: LogIndex,
}

impl NodeMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            configuration: ClusterConfig::default(),
            snapshot_last_index: 0,
        }
    }
}

/// An error from a [`Wait`] condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for: {1}")]
    Timeout(Duration, String),

    #[error("node shut down while waiting for: {0}")]
    Shutdown(String),
}

/// A handle for awaiting metrics conditions with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<NodeMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<NodeMetrics, WaitError>
    where
        T: Fn(&NodeMetrics) -> bool + Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg);
                return Ok(latest);
            }
            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_closed)) => return Err(WaitError::Shutdown(msg.to_string())),
                Err(_elapsed) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the log to reach `want` appended and applied entries.
    pub async fn log(&self, want: LogIndex, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want && m.last_applied >= want,
            &format!("{} log >= {}", msg, want),
        )
        .await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: LogIndex, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, &format!("{} applied >= {}", msg, want)).await
    }

    /// Wait for the node to assume `want` role.
    pub async fn role(&self, want: Role, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.role == want, &format!("{} role == {:?}", msg, want)).await
    }

    /// Wait for the node to observe `leader` as the current leader.
    pub async fn current_leader(&self, leader: NodeId, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} leader == {}", msg, leader),
        )
        .await
    }

    /// Wait for the snapshot to cover at least `want`.
    pub async fn snapshot(&self, want: LogIndex, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(
            |m| m.snapshot_last_index >= want,
            &format!("{} snapshot >= {}", msg, want),
        )
        .await
    }
}
