//! The transport seam between consensus peers.

use async_trait::async_trait;
use tokio::time::Duration;

use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::RequestVoteRequest;
use crate::message::RequestVoteResponse;
use crate::NodeId;

/// A failure reported by a `Transport` implementation.
///
/// Classification is by kind, never by message content: the retry engine
/// consults [`TransportError::is_retryable`] and nothing else.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    /// No response arrived within the caller-supplied timeout.
    #[error("request timed out")]
    Timeout,

    /// The peer actively refused the connection.
    #[error("connection refused by peer")]
    Refused,

    /// The peer could not be reached.
    #[error("peer unreachable")]
    Unreachable,

    /// A transient failure of some other kind.
    #[error("transient transport failure: {0}")]
    Temporary(String),

    /// The frame could not be (de)serialized. Retrying cannot help.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the retry engine may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Refused | Self::Unreachable | Self::Temporary(_) => true,
            Self::Malformed(_) | Self::Closed => false,
        }
    }
}

/// The RPC send seam used by the consensus core.
///
/// Implementations frame and ship the request to `target` and resolve with
/// the deserialized response or a [`TransportError`]; they never interpret
/// request semantics. `timeout` bounds the whole exchange. A dropped
/// (cancelled) send may or may not have been delivered; the caller stops
/// awaiting and the transport must release any per-request state.
///
/// On the inbound side, implementations deliver each deserialized request to
/// the corresponding entry point of the local [`Node`](crate::node::Node) —
/// `append_entries`, `vote` or `install_snapshot` — and ship the returned
/// response back to the sender.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a RequestVote RPC to the target node.
    async fn send_request_vote(
        &self,
        target: NodeId,
        rpc: RequestVoteRequest,
        timeout: Duration,
    ) -> Result<RequestVoteResponse, TransportError>;

    /// Send an AppendEntries RPC to the target node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse, TransportError>;

    /// Send an InstallSnapshot RPC to the target node.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_is_by_kind() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Refused.is_retryable());
        assert!(TransportError::Unreachable.is_retryable());
        assert!(TransportError::Temporary("flaky".into()).is_retryable());

        assert!(!TransportError::Malformed("bad frame".into()).is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }
}
