use std::collections::BTreeSet;

use tokio::time::Duration;

use crate::clock::Clock;
use crate::collector::ResponseSet;
use crate::core::LeaderState;
use crate::core::NodeCore;
use crate::core::Role;
use crate::error::ClientError;
use crate::error::FatalError;
use crate::message::AppendEntriesRequest;
use crate::message::ClusterConfig;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::Snapshot;
use crate::message::SnapshotMeta;
use crate::network::Transport;
use crate::quorum;
use crate::replication::LeaderEvent;
use crate::retry::OP_HEARTBEAT;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::waiter::CommitWaiter;
use crate::waiter::OpResponseTx;
use crate::LogId;
use crate::LogIndex;
use crate::NodeId;

impl<T, C, L, S, M> NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Apply every committed-but-unapplied entry to the state machine, in
    /// log order, resolving any client operations waiting on those indices.
    ///
    /// Configuration entries are not delivered to the state machine; they
    /// are returned so the leader can drive membership-change bookkeeping.
    pub(super) async fn apply_committed_entries(
        &mut self,
        mut waiter: Option<&mut CommitWaiter>,
    ) -> Result<Vec<(LogIndex, ClusterConfig)>, FatalError> {
        let mut committed_configs = Vec::new();
        if self.commit_index <= self.last_applied.index {
            return Ok(committed_configs);
        }

        let entries = self
            .log_store
            .entries(self.last_applied.index + 1, self.commit_index + 1)
            .await
            .map_err(|err| self.fatal(err))?;

        for entry in entries {
            let index = entry.log_id.index;
            match entry.payload {
                EntryPayload::Command(command) => {
                    let result = self.state_machine.apply(index, &command).await;
                    if let Err(err) = &result {
                        // Deterministic state machines fail identically on
                        // every node, so the cluster stays consistent; the
                        // failure is surfaced to the waiting client and
                        // last_applied still advances.
                        tracing::error!(index, error=%err, "state machine apply failed");
                    }
                    self.bytes_since_snapshot += command.len() as u64;
                    if let Some(waiter) = waiter.as_mut() {
                        waiter.notify_committed_and_applied(index, move |_| result);
                    }
                }
                EntryPayload::Configuration(cfg) => {
                    committed_configs.push((index, cfg));
                }
                EntryPayload::Noop => {}
            }
            self.last_applied = entry.log_id;
        }

        self.report_metrics();
        Ok(committed_configs)
    }

    /// Capture a snapshot once enough command bytes have been applied, then
    /// fold the covered log prefix away.
    pub(super) async fn maybe_snapshot(&mut self) -> Result<(), FatalError> {
        if self.bytes_since_snapshot < self.config.snapshot_threshold_bytes {
            return Ok(());
        }
        if self.last_applied.index == 0 || self.last_applied.index <= self.snapshot_last.index {
            return Ok(());
        }

        let data = match self.state_machine.snapshot().await {
            Ok(data) => data,
            Err(err) => {
                // Not fatal; the threshold will trip again.
                tracing::error!(error=%err, "error capturing state machine snapshot");
                return Ok(());
            }
        };

        self.snapshot_seq += 1;
        let meta = SnapshotMeta {
            last_included: self.last_applied,
            configuration: self.membership.clone(),
            snapshot_id: format!("{}-{}-{}", self.id, self.current_term, self.snapshot_seq),
        };
        tracing::info!(last_included = %meta.last_included, bytes = data.len(), "captured snapshot");

        let snapshot = Snapshot { meta, data };
        self.state_store.save_snapshot(&snapshot).await.map_err(|err| self.fatal(err))?;
        self.log_store
            .discard_prefix(self.last_applied.index)
            .await
            .map_err(|err| self.fatal(err))?;
        self.snapshot_last = self.last_applied;
        self.bytes_since_snapshot = 0;
        self.report_metrics();
        Ok(())
    }
}

impl<'a, T, C, L, S, M> LeaderState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Handle a client command submission.
    #[tracing::instrument(level = "debug", skip(self, command, timeout, tx), fields(len=command.len()))]
    pub(super) async fn handle_submit_command(
        &mut self,
        command: Vec<u8>,
        timeout: Duration,
        tx: OpResponseTx,
    ) -> Result<(), FatalError> {
        let entry = self.append_payload(EntryPayload::Command(command)).await?;
        let deadline = self.core.clock.now() + timeout;
        self.waiter.register(entry.log_id.index, tx, deadline);
        self.replicate_appended().await
    }

    /// Assign the next index, append the payload to the log and adopt any
    /// configuration it carries.
    pub(super) async fn append_payload(&mut self, payload: EntryPayload) -> Result<Entry, FatalError> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        self.core
            .log_store
            .append(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.fatal(err))?;
        self.core.last_log_id = entry.log_id;
        if let EntryPayload::Configuration(cfg) = &entry.payload {
            self.core.membership = cfg.clone();
        }
        self.core.report_metrics();
        Ok(entry)
    }

    /// Tell every replication stream about newly appended entries.
    pub(super) fn notify_streams_of_append(&mut self) {
        for node in self.nodes.values() {
            let _ = node.stream.tx.send((
                LeaderEvent::Replicate {
                    last_log_index: self.core.last_log_id.index,
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Kick replication after an append and advance the commit index where
    /// the configuration already allows it (single-voter clusters commit on
    /// local append alone).
    pub(super) async fn replicate_appended(&mut self) -> Result<(), FatalError> {
        self.notify_streams_of_append();
        self.try_advance_commit().await
    }

    /// Advance the commit index as far as the commit rule allows, applying
    /// entries and driving membership-change progress as configurations
    /// commit. Loops because handling a committed configuration may append
    /// (and, on small clusters, instantly commit) the follow-up entry.
    ///
    /// An index N commits iff the current configuration's quorum (both
    /// groups while joint) has replicated N *and* the entry at N carries
    /// the leader's current term; earlier-term entries commit only by
    /// committing a later current-term entry past them.
    pub(super) async fn try_advance_commit(&mut self) -> Result<(), FatalError> {
        loop {
            let mut candidate = self.core.commit_index;
            for n in (self.core.commit_index + 1)..=self.core.last_log_id.index {
                let mut acked: BTreeSet<NodeId> =
                    self.nodes.iter().filter(|(_, r)| r.match_index >= n).map(|(id, _)| *id).collect();
                acked.insert(self.core.id);
                if self.core.membership.has_quorum(&acked) {
                    candidate = n;
                } else {
                    break;
                }
            }
            if candidate <= self.core.commit_index {
                return Ok(());
            }

            let candidate_term = self
                .core
                .log_store
                .try_entry(candidate)
                .await
                .map_err(|err| self.core.fatal(err))?
                .map(|e| e.log_id.term);
            if candidate_term != Some(self.core.current_term) {
                // Nothing from our own term is replicated yet; committing an
                // earlier-term entry directly is the classic unsafety.
                return Ok(());
            }

            self.core.commit_index = candidate;
            tracing::debug!(commit_index = candidate, "commit index advanced");
            for node in self.nodes.values() {
                let _ = node.stream.tx.send((
                    LeaderEvent::UpdateCommitIndex {
                        commit_index: candidate,
                    },
                    tracing::debug_span!("CH"),
                ));
            }

            let committed_configs = self.core.apply_committed_entries(Some(&mut self.waiter)).await?;
            for (index, cfg) in committed_configs {
                self.handle_config_committed(index, cfg).await?;
            }
            self.core.maybe_snapshot().await?;

            if !self.core.target_role.is_leader() {
                return Ok(());
            }
        }
    }

    /// Handle a linearizable read.
    ///
    /// The leader records the commit index at the moment the read arrives,
    /// confirms its leadership with a one-shot heartbeat round, and only
    /// then queries the state machine. Committed-before-the-read entries
    /// are thus always visible to the query.
    #[tracing::instrument(level = "debug", skip(self, request, timeout, tx))]
    pub(super) async fn handle_read_state(
        &mut self,
        request: Vec<u8>,
        timeout: Duration,
        tx: OpResponseTx,
    ) -> Result<(), FatalError> {
        let read_commit = self.core.commit_index;

        match self.confirm_leadership(timeout).await? {
            Ok(()) => {}
            Err(err) => {
                let _ = tx.send(Err(err));
                return Ok(());
            }
        }

        // Commit advancement applies synchronously, so confirmation implies
        // freshness; this catches any straggler.
        if self.core.last_applied.index < read_commit {
            self.core.apply_committed_entries(None).await?;
        }

        let res = self
            .core
            .state_machine
            .query(&request)
            .await
            .map_err(|err| ClientError::ApplicationFailed {
                cause: err.to_string(),
            });
        let _ = tx.send(res);
        Ok(())
    }

    /// Exchange a one-shot heartbeat round with a quorum to prove this node
    /// is still the leader.
    async fn confirm_leadership(&mut self, timeout: Duration) -> Result<Result<(), ClientError>, FatalError> {
        let membership = self.core.membership.clone();
        let peers: Vec<NodeId> = membership.all_nodes().into_iter().filter(|id| id != &self.core.id).collect();
        if peers.is_empty() {
            return Ok(Ok(()));
        }

        let term = self.core.current_term;
        let rpc = AppendEntriesRequest {
            term,
            leader_id: self.core.id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: self.core.commit_index,
        };
        let rpc_ttl = self
            .core
            .retry
            .effective_timeout(Duration::from_millis(self.core.config.rpc_timeout));

        let futures: Vec<_> = peers
            .iter()
            .map(|peer| {
                let peer = *peer;
                let transport = self.core.transport.clone();
                let clock = self.core.clock.clone();
                let retry = self.core.retry.clone();
                let rpc = rpc.clone();
                async move {
                    retry
                        .execute(OP_HEARTBEAT, clock.as_ref(), || {
                            let transport = transport.clone();
                            let rpc = rpc.clone();
                            async move { transport.send_append_entries(peer, rpc, rpc_ttl).await }
                        })
                        .await
                        .map(|resp| (peer, resp))
                }
            })
            .collect();
        let set = ResponseSet::new(futures);

        let responses = if membership.is_joint() {
            // Joint consensus needs per-group tallies; let the round run to
            // the deadline or full settlement.
            set.settle_all(timeout).await.into_iter().filter_map(|r| r.ok()).collect()
        } else {
            let needed = quorum::majority_of(membership.nodes.len()).saturating_sub(1).min(peers.len());
            match set.majority(needed, timeout).await {
                Ok(responses) => responses,
                Err(partial) => partial.responses,
            }
        };

        for (peer, resp) in &responses {
            if resp.term > term {
                tracing::info!(peer, term = resp.term, "read round observed higher term, stepping down");
                self.core.update_current_term(resp.term, None);
                self.core.persist_state().await?;
                self.core.current_leader = None;
                self.core.set_target_role(Role::Follower);
                self.core.report_metrics();
                return Ok(Err(ClientError::LeadershipLost {
                    old_term: term,
                    new_term: resp.term,
                }));
            }
        }

        let mut acked: BTreeSet<NodeId> = responses.iter().map(|(peer, _)| *peer).collect();
        acked.insert(self.core.id);
        if membership.has_quorum(&acked) {
            Ok(Ok(()))
        } else {
            tracing::debug!(acks = acked.len(), "read round failed to reach a quorum");
            Ok(Err(ClientError::ReadTimeout))
        }
    }
}
