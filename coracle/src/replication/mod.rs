//! Per-peer replication streams.
//!
//! The leader spawns one task per peer. Each task owns the peer's
//! `next_index`/`match_index` cursors and keeps at most one AppendEntries
//! RPC in flight, so responses for a peer are always processed in request
//! order. Entries are read straight from the log store; the leader only
//! signals new work (and commit advancement) over the stream's channel.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::Span;
use tracing_futures::Instrument;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::StorageError;
use crate::message::AppendEntriesRequest;
use crate::message::InstallSnapshotRequest;
use crate::network::Transport;
use crate::retry::RetryEngine;
use crate::retry::OP_APPEND_ENTRIES;
use crate::retry::OP_HEARTBEAT;
use crate::retry::OP_INSTALL_SNAPSHOT;
use crate::storage::LogStore;
use crate::storage::StateStore;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// An event from the leader to a replication stream.
pub(crate) enum LeaderEvent {
    /// New entries have been appended and are ready for replication.
    Replicate {
        /// The index of the most recently appended entry.
        last_log_index: LogIndex,
        /// The leader's current commit index.
        commit_index: LogIndex,
    },
    /// The leader's commit index advanced.
    UpdateCommitIndex { commit_index: LogIndex },
    /// The stream should shut down.
    Terminate,
}

/// An event from a replication stream back to the leader.
pub(crate) enum ReplicaEvent {
    /// The target acknowledged entries up to `match_index`.
    UpdateMatchIndex { target: NodeId, match_index: LogIndex },
    /// The target reported a higher term; the leader must step down.
    RevertToFollower { target: NodeId, term: Term },
    /// The stream hit a fatal storage error.
    Shutdown,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the stream's task.
    pub tx: mpsc::UnboundedSender<(LeaderEvent, Span)>,
}

impl ReplicationStream {
    /// Spawn a new replication task for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<T, C, L, S>(
        id: NodeId,
        target: NodeId,
        term: Term,
        config: Arc<Config>,
        last_log_index: LogIndex,
        commit_index: LogIndex,
        transport: Arc<T>,
        clock: Arc<C>,
        log_store: Arc<L>,
        state_store: Arc<S>,
        retry: Arc<RetryEngine>,
        core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self
    where
        T: Transport,
        C: Clock,
        L: LogStore,
        S: StateStore,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let heartbeat = tokio::time::interval(Duration::from_millis(config.heartbeat_interval));
        let this = ReplicationCore {
            id,
            target,
            term,
            config,
            transport,
            clock,
            log_store,
            state_store,
            retry,
            core_tx,
            rx,
            state: StreamState::Replicating,
            last_log_index,
            commit_index,
            next_index: last_log_index + 1,
            match_index: 0,
            heartbeat,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { tx }
    }
}

#[derive(PartialEq, Eq)]
enum StreamState {
    Replicating,
    Shutdown,
}

struct ReplicationCore<T, C, L, S>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
{
    /// The ID of this node, the leader.
    id: NodeId,
    /// The ID of the target peer.
    target: NodeId,
    /// The leader's term, fixed for the lifetime of this stream.
    term: Term,
    config: Arc<Config>,
    transport: Arc<T>,
    clock: Arc<C>,
    log_store: Arc<L>,
    state_store: Arc<S>,
    retry: Arc<RetryEngine>,

    core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    rx: mpsc::UnboundedReceiver<(LeaderEvent, Span)>,

    state: StreamState,

    /// The index of the leader's most recently appended entry.
    last_log_index: LogIndex,
    /// The leader's commit index, shipped with every request.
    commit_index: LogIndex,
    /// The index of the next entry to send to the target.
    next_index: LogIndex,
    /// The highest index known replicated on the target.
    match_index: LogIndex,

    heartbeat: tokio::time::Interval,
}

impl<T, C, L, S> ReplicationCore<T, C, L, S>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
{
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        loop {
            if self.state == StreamState::Shutdown {
                return;
            }

            if self.next_index <= self.last_log_index {
                // Behind: ship the next batch without waiting for a tick.
                self.send_append_entries(false).await;
                self.drain_events();
            } else {
                tokio::select! {
                    _ = self.heartbeat.tick() => self.send_append_entries(true).await,
                    event = self.rx.recv() => match event {
                        Some((event, _span)) => self.process_event(event),
                        None => self.state = StreamState::Shutdown,
                    }
                }
            }
        }
    }

    fn process_event(&mut self, event: LeaderEvent) {
        match event {
            LeaderEvent::Replicate {
                last_log_index,
                commit_index,
            } => {
                self.last_log_index = last_log_index;
                self.commit_index = commit_index;
            }
            LeaderEvent::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            LeaderEvent::Terminate => {
                self.state = StreamState::Shutdown;
            }
        }
    }

    /// Drain any queued events from the leader without blocking.
    fn drain_events(&mut self) {
        while let Some(Some((event, _span))) = self.rx.recv().now_or_never() {
            self.process_event(event);
            if self.state == StreamState::Shutdown {
                return;
            }
        }
    }

    /// Send one AppendEntries RPC to the target: the next batch of entries,
    /// or an empty heartbeat.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self, heartbeat_only: bool) {
        let prev_log_index = self.next_index - 1;

        let first = match self.log_store.first_index().await {
            Ok(first) => first,
            Err(err) => return self.fatal_storage(err),
        };
        if prev_log_index > 0 && prev_log_index < first {
            // The target needs entries already folded into the snapshot.
            return self.stream_snapshot().await;
        }

        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match self.log_store.try_entry(prev_log_index).await {
                Ok(Some(entry)) => entry.log_id.term,
                Ok(None) | Err(StorageError::Compacted { .. }) => return self.stream_snapshot().await,
                Err(err) => return self.fatal_storage(err),
            }
        };

        let entries = if heartbeat_only || self.next_index > self.last_log_index {
            Vec::new()
        } else {
            let hi = (self.last_log_index + 1).min(self.next_index + self.config.max_entries_per_append);
            match self.log_store.entries(self.next_index, hi).await {
                Ok(entries) => entries,
                Err(StorageError::Compacted { .. }) => return self.stream_snapshot().await,
                Err(err) => return self.fatal_storage(err),
            }
        };
        let batch_len = entries.len() as u64;

        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        let (operation, default_timeout) = if batch_len == 0 {
            (OP_HEARTBEAT, self.config.rpc_timeout)
        } else {
            (OP_APPEND_ENTRIES, self.config.append_entries_timeout)
        };
        let ttl = self.retry.effective_timeout(Duration::from_millis(default_timeout));

        let target = self.target;
        let res = self
            .retry
            .execute(operation, self.clock.as_ref(), || {
                let transport = self.transport.clone();
                let rpc = rpc.clone();
                async move { transport.send_append_entries(target, rpc, ttl).await }
            })
            .await;

        let resp = match res {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(target=self.target, error=%err, "AppendEntries to target failed, will re-probe");
                // Transient outage: wait a beat before probing again.
                self.clock.sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
                return;
            }
        };

        if resp.term > self.term {
            let _ = self.core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: resp.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.state = StreamState::Shutdown;
            return;
        }

        if resp.success {
            let acked = prev_log_index + batch_len;
            if acked > self.match_index {
                self.match_index = acked;
                self.next_index = acked + 1;
                let _ = self.core_tx.send((
                    ReplicaEvent::UpdateMatchIndex {
                        target: self.target,
                        match_index: acked,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
            return;
        }

        // A semantic rejection, not a transport failure: step next_index
        // back, using the follower's conflict hint when present.
        match resp.conflict_index {
            Some(conflict_index) => {
                tracing::debug!(
                    target = self.target,
                    conflict_index,
                    conflict_term = ?resp.conflict_term,
                    "consistency check failed, backing off via conflict hint"
                );
                self.next_index = conflict_index.max(1);
            }
            None => {
                self.next_index = self.next_index.saturating_sub(1).max(1);
            }
        }
        if self.match_index >= self.next_index {
            self.match_index = self.next_index - 1;
        }
    }

    /// Stream the current snapshot to the target, chunk by chunk.
    ///
    /// An interrupted transfer restarts from offset 0: the follower discards
    /// partial state whenever it sees offset 0, so restarting is always safe.
    #[tracing::instrument(level = "debug", skip(self), fields(target=self.target))]
    async fn stream_snapshot(&mut self) {
        let snapshot = match self.state_store.load_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!(
                    target = self.target,
                    next_index = self.next_index,
                    "target is behind the log start but no snapshot exists yet"
                );
                self.clock.sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
                return;
            }
            Err(err) => return self.fatal_storage(err),
        };

        let total = snapshot.data.len() as u64;
        let chunk_size = self.config.snapshot_chunk_size.max(1);
        let ttl = self.retry.effective_timeout(Duration::from_millis(self.config.install_snapshot_timeout));
        let mut offset: u64 = 0;

        loop {
            self.drain_events();
            if self.state == StreamState::Shutdown {
                return;
            }

            let end = (offset + chunk_size).min(total);
            let done = end == total;
            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: snapshot.data[offset as usize..end as usize].to_vec(),
                done,
            };
            tracing::debug!(target = self.target, offset, len = rpc.data.len(), done, "sending snapshot chunk");

            let target = self.target;
            let res = self
                .retry
                .execute(OP_INSTALL_SNAPSHOT, self.clock.as_ref(), || {
                    let transport = self.transport.clone();
                    let rpc = rpc.clone();
                    async move { transport.send_install_snapshot(target, rpc, ttl).await }
                })
                .await;

            match res {
                Ok(resp) => {
                    if resp.term > self.term {
                        let _ = self.core_tx.send((
                            ReplicaEvent::RevertToFollower {
                                target: self.target,
                                term: resp.term,
                            },
                            tracing::debug_span!("CH"),
                        ));
                        self.state = StreamState::Shutdown;
                        return;
                    }
                    if done {
                        self.next_index = snapshot.meta.last_included.index + 1;
                        self.match_index = snapshot.meta.last_included.index;
                        let _ = self.core_tx.send((
                            ReplicaEvent::UpdateMatchIndex {
                                target: self.target,
                                match_index: self.match_index,
                            },
                            tracing::debug_span!("CH"),
                        ));
                        return;
                    }
                    offset = end;
                }
                Err(err) => {
                    tracing::warn!(target=self.target, error=%err, "snapshot chunk failed, restarting transfer");
                    self.clock.sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
                    offset = 0;
                }
            }
        }
    }

    fn fatal_storage(&mut self, err: StorageError) {
        tracing::error!(error=%err, target=self.target, "storage error in replication stream");
        let _ = self.core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
        self.state = StreamState::Shutdown;
    }
}
