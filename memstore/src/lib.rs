//! An in-memory implementation of the coracle storage traits.
//!
//! `MemStore` implements all three seams — `LogStore`, `StateStore` and
//! `StateMachine` — so a test node can be wired up from a single `Arc`. The
//! state machine is a byte register: applying a command overwrites the
//! register and echoes the command back as the reply, and a query returns
//! the register's current value. That is just enough behavior to observe
//! ordering, snapshots and linearizable reads from the outside.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use coracle::error::StorageError;
use coracle::message::Entry;
use coracle::message::PersistentState;
use coracle::message::Snapshot;
use coracle::storage::LogStore;
use coracle::storage::StateMachine;
use coracle::storage::StateStore;
use coracle::LogId;
use coracle::LogIndex;
use coracle::NodeId;
use coracle::StateMachineError;

/// The serializable state of the register state machine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemStateMachine {
    /// The index of the last applied command.
    pub last_applied: LogIndex,
    /// The register's current value: the payload of the last command.
    pub value: Vec<u8>,
    /// Every applied `(index, command)` pair, for test assertions.
    pub applied: Vec<(LogIndex, Vec<u8>)>,
}

/// An in-memory log, state store and state machine.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<LogIndex, Entry>>,
    /// The id of the last entry discarded into a snapshot.
    last_purged: RwLock<LogId>,
    state: RwLock<Option<PersistentState>>,
    snapshot: RwLock<Option<Snapshot>>,
    sm: RwLock<MemStateMachine>,
}

impl MemStore {
    /// Create a new `MemStore` for the node bearing the given ID.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(LogId::default()),
            state: RwLock::new(None),
            snapshot: RwLock::new(None),
            sm: RwLock::new(MemStateMachine::default()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get a copy of the raw log, for test assertions.
    pub async fn get_log(&self) -> BTreeMap<LogIndex, Entry> {
        self.log.read().await.clone()
    }

    /// Insert an entry directly into the log, for test setup.
    pub async fn put_entry(&self, entry: Entry) {
        self.log.write().await.insert(entry.log_id.index, entry);
    }

    /// Get a copy of the state machine, for test assertions.
    pub async fn get_state_machine(&self) -> MemStateMachine {
        self.sm.read().await.clone()
    }

    /// Read the persisted election state, for test assertions.
    pub async fn read_persistent_state(&self) -> Option<PersistentState> {
        self.state.read().await.clone()
    }

    /// Read the stored snapshot, for test assertions.
    pub async fn read_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl LogStore for MemStore {
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append(&self, entries: &[Entry]) -> Result<LogIndex, StorageError> {
        let mut log = self.log.write().await;
        let last = log.keys().next_back().copied().unwrap_or(self.last_purged.read().await.index);
        let mut expected = last + 1;
        for entry in entries {
            if entry.log_id.index != expected {
                return Err(StorageError::OutOfOrderAppend {
                    expected,
                    got: entry.log_id.index,
                });
            }
            log.insert(entry.log_id.index, entry.clone());
            expected += 1;
        }
        Ok(expected - 1)
    }

    async fn try_entry(&self, index: LogIndex) -> Result<Option<Entry>, StorageError> {
        let purged = *self.last_purged.read().await;
        if index > 0 && index <= purged.index {
            return Err(StorageError::Compacted { index });
        }
        Ok(self.log.read().await.get(&index).cloned())
    }

    async fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, StorageError> {
        let purged = *self.last_purged.read().await;
        if lo <= purged.index {
            return Err(StorageError::Compacted { index: lo });
        }
        Ok(self.log.read().await.range(lo..hi).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn truncate_suffix(&self, from: LogIndex) -> Result<(), StorageError> {
        let mut log = self.log.write().await;
        let doomed: Vec<LogIndex> = log.range(from..).map(|(index, _)| *index).collect();
        for index in doomed {
            log.remove(&index);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn discard_prefix(&self, through: LogIndex) -> Result<(), StorageError> {
        let mut log = self.log.write().await;
        let mut purged = self.last_purged.write().await;
        let boundary = log
            .get(&through)
            .map(|entry| entry.log_id)
            .unwrap_or(LogId::new(purged.term, through.max(purged.index)));
        let doomed: Vec<LogIndex> = log.range(..=through).map(|(index, _)| *index).collect();
        for index in doomed {
            log.remove(&index);
        }
        if boundary.index > purged.index {
            *purged = boundary;
        }
        Ok(())
    }

    async fn first_index(&self) -> Result<LogIndex, StorageError> {
        let purged = *self.last_purged.read().await;
        Ok(purged.index + 1)
    }

    async fn last_index(&self) -> Result<LogIndex, StorageError> {
        let log = self.log.read().await;
        let purged = *self.last_purged.read().await;
        Ok(log.keys().next_back().copied().unwrap_or(purged.index))
    }

    async fn last_log_id(&self) -> Result<LogId, StorageError> {
        let log = self.log.read().await;
        let purged = *self.last_purged.read().await;
        Ok(log.values().next_back().map(|entry| entry.log_id).unwrap_or(purged))
    }
}

#[async_trait]
impl StateStore for MemStore {
    async fn load(&self) -> Result<PersistentState, StorageError> {
        Ok(self.state.read().await.clone().unwrap_or_default())
    }

    #[tracing::instrument(level = "trace", skip(self, state))]
    async fn save(&self, state: &PersistentState) -> Result<(), StorageError> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(last_included=%snapshot.meta.last_included))]
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.read().await.clone())
    }
}

#[async_trait]
impl StateMachine for MemStore {
    #[tracing::instrument(level = "trace", skip(self, command))]
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        let mut sm = self.sm.write().await;
        if index <= sm.last_applied {
            return Err(StateMachineError(anyhow!(
                "apply out of order: index {} already applied (last_applied={})",
                index,
                sm.last_applied
            )));
        }
        sm.last_applied = index;
        sm.value = command.to_vec();
        sm.applied.push((index, command.to_vec()));
        Ok(command.to_vec())
    }

    async fn query(&self, _request: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        Ok(self.sm.read().await.value.clone())
    }

    async fn snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        let sm = self.sm.read().await;
        serde_json::to_vec(&*sm).map_err(|err| StateMachineError(err.into()))
    }

    async fn restore(&self, data: &[u8]) -> Result<(), StateMachineError> {
        let restored: MemStateMachine = serde_json::from_slice(data).map_err(|err| StateMachineError(err.into()))?;
        *self.sm.write().await = restored;
        Ok(())
    }
}
