//! The storage and state-machine seams.
//!
//! The consensus core is the sole owner of its stores: it never issues
//! concurrent writes, and the state machine is touched only from the apply
//! path. Every mutation must be durable before the call returns — the core
//! responds to RPCs immediately after these calls, and the protocol's safety
//! rests on acknowledged state surviving a crash.

use async_trait::async_trait;

use crate::error::StateMachineError;
use crate::error::StorageError;
use crate::message::Entry;
use crate::message::PersistentState;
use crate::message::Snapshot;
use crate::LogId;
use crate::LogIndex;

/// An ordered, append-only log of entries indexed from 1.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Append entries contiguously, returning the index of the last one.
    ///
    /// Fails with [`StorageError::OutOfOrderAppend`] if the first entry's
    /// index is not `last_index() + 1`.
    async fn append(&self, entries: &[Entry]) -> Result<LogIndex, StorageError>;

    /// Get the entry at `index`, or `None` if the log does not contain it.
    ///
    /// Fails with [`StorageError::Compacted`] if `index` is below
    /// `first_index`.
    async fn try_entry(&self, index: LogIndex) -> Result<Option<Entry>, StorageError>;

    /// Get the entries in `[lo, hi)`.
    ///
    /// Fails with [`StorageError::Compacted`] if `lo` is below `first_index`.
    async fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, StorageError>;

    /// Delete all entries with index `>= from`. Durable before return.
    async fn truncate_suffix(&self, from: LogIndex) -> Result<(), StorageError>;

    /// Delete all entries with index `<= through`, after they have been
    /// captured in a snapshot. Durable before return.
    async fn discard_prefix(&self, through: LogIndex) -> Result<(), StorageError>;

    /// The smallest retained index. For a pristine log this is 1; after a
    /// prefix discard through index `x` it is `x + 1`.
    async fn first_index(&self) -> Result<LogIndex, StorageError>;

    /// The index of the last appended entry, or of the last discarded entry
    /// if the log is empty; 0 for a pristine log.
    async fn last_index(&self) -> Result<LogIndex, StorageError>;

    /// The log id of the entry at `last_index`.
    async fn last_log_id(&self) -> Result<LogId, StorageError>;
}

/// Durable storage for a node's election state and its latest snapshot.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Load the persisted election state; the default for a pristine store.
    async fn load(&self) -> Result<PersistentState, StorageError>;

    /// Atomically and durably replace the persisted election state.
    ///
    /// Callers must invoke this before any externally observable action
    /// which depends on the new term or vote.
    async fn save(&self, state: &PersistentState) -> Result<(), StorageError>;

    /// Durably replace the stored snapshot.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the stored snapshot, if one exists.
    async fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// The application state machine fed by committed log entries.
///
/// Only `Command` payloads are delivered to `apply`; configuration entries
/// are consumed by the consensus core itself. Entries arrive strictly in
/// log-index order. An implementation must be deterministic: the same
/// command sequence produces the same state and replies on every node.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed command, returning the reply bytes delivered to
    /// the client which submitted it.
    ///
    /// An error here is surfaced to the waiting client (if any) and logged;
    /// the node itself continues, and `last_applied` still advances past the
    /// failed index.
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Answer a read-only query against current state. The request payload
    /// is application-defined; the core only guarantees freshness (the query
    /// runs after every entry committed before the read was issued has been
    /// applied).
    async fn query(&self, request: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Serialize the current state for a snapshot.
    async fn snapshot(&self) -> Result<Vec<u8>, StateMachineError>;

    /// Replace the current state with a previously captured snapshot.
    async fn restore(&self, data: &[u8]) -> Result<(), StateMachineError>;
}
