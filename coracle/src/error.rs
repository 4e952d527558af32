//! Error types surfaced by the consensus engine.
//!
//! Transport failures never reach this module's client-facing types: they
//! are absorbed by the retry engine and, once retries are exhausted, degrade
//! into the higher-level outcomes below (an election or read times out,
//! replication stalls). Protocol responses such as a denied vote or a higher
//! term are not errors at all; they drive state transitions directly.

use crate::membership::ChangePhase;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// An error related to the local storage layer. Always fatal: the node halts
/// rather than risk serving from inconsistent state.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested index has been discarded into a snapshot.
    #[error("log index {index} has been compacted into a snapshot")]
    Compacted { index: LogIndex },

    /// An append did not continue the log contiguously.
    #[error("out-of-order append: expected index {expected}, got {got}")]
    OutOfOrderAppend { expected: LogIndex, got: LogIndex },

    /// An underlying media failure.
    #[error("storage failure: {0}")]
    Io(#[from] anyhow::Error),
}

/// An error raised by a `StateMachine` while applying a command or
/// serving a query.
#[derive(Debug, thiserror::Error)]
#[error("state machine error: {0}")]
pub struct StateMachineError(#[from] pub anyhow::Error);

/// The error type carried out of the consensus core task when it halts.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("state machine could not restore from snapshot: {0}")]
    Restore(#[from] StateMachineError),
}

/// The complete set of errors a client of the node may observe.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ClientError {
    /// The operation was sent to a node which is not the leader.
    #[error("node is not the leader")]
    NotLeader { leader_hint: Option<NodeId> },

    /// Leadership was lost while the operation was pending.
    #[error("leadership lost while the operation was pending ({old_term} -> {new_term})")]
    LeadershipLost { old_term: Term, new_term: Term },

    /// The entry did not commit before the operation's deadline.
    #[error("operation timed out before its entry committed")]
    CommitTimeout,

    /// Leadership could not be confirmed before the read deadline.
    #[error("read timed out before leadership was confirmed")]
    ReadTimeout,

    /// The state machine failed while applying the command.
    #[error("state machine failed to apply the command: {cause}")]
    ApplicationFailed { cause: String },

    /// A membership change failed or was cancelled.
    #[error("membership change failed during the {phase} phase: {reason}")]
    ConfigurationChange { phase: ChangePhase, reason: String },

    /// A membership change was requested while another was still running.
    #[error("another membership change is already in progress")]
    ChangeInProgress,

    /// The node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// A configuration value failed validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigError {
    /// The offending field.
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// The node handle's channel to the core task has closed.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("consensus core has shut down")]
pub struct Shutdown;
