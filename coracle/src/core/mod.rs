//! The core logic of a consensus node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::clock::Clock;
use crate::collector::MajorityNotReached;
use crate::config::Config;
use crate::error::ClientError;
use crate::error::FatalError;
use crate::error::StateMachineError;
use crate::error::StorageError;
use crate::membership::MembershipSynchronizer;
use crate::message::ClusterConfig;
use crate::message::PersistentState;
use crate::message::RequestVoteResponse;
use crate::metrics::NodeMetrics;
use crate::network::Transport;
use crate::node::NodeMsg;
use crate::replication::LeaderEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::retry::RetryEngine;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::waiter::CommitWaiter;
use crate::LogId;
use crate::LogIndex;
use crate::NodeId;

/// The role a consensus node currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating entries from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// An in-progress inbound snapshot transfer.
pub(self) struct SnapshotInstall {
    /// The transfer id of the stream being assembled.
    pub id: String,
    /// Chunks received so far, contiguous from offset 0.
    pub buf: Vec<u8>,
}

/// The core type implementing the consensus protocol.
///
/// All mutable state lives here, owned by a single spawned task; the role
/// loops below borrow it exclusively while their role is active.
pub(crate) struct NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: ClusterConfig,
    /// The member set applied when the stores are pristine.
    seed_members: BTreeSet<NodeId>,

    transport: Arc<T>,
    clock: Arc<C>,
    log_store: Arc<L>,
    state_store: Arc<S>,
    state_machine: Arc<M>,
    retry: Arc<RetryEngine>,

    /// The role the main loop should be running.
    target_role: Role,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Initialized from the snapshot boundary only; everything beyond is
    /// re-established through the protocol after a restart.
    commit_index: LogIndex,
    /// The id of the highest log entry applied to the state machine.
    last_applied: LogId,

    /// The current term. Durable via the state store.
    current_term: u64,
    /// The ID of the current cluster leader, as far as this node knows.
    current_leader: Option<NodeId>,
    /// The candidate this node voted for in the current term. Durable.
    voted_for: Option<NodeId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The id of the last entry covered by the current snapshot.
    snapshot_last: LogId,
    /// Applied command payload bytes since the last snapshot.
    bytes_since_snapshot: u64,
    /// Monotonic counter distinguishing outbound snapshot transfers.
    snapshot_seq: u64,
    /// An inbound snapshot transfer being assembled, if any.
    installing: Option<SnapshotInstall>,

    /// The instant at which the election timer fires next.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<(NodeMsg, Span)>,
    tx_metrics: watch::Sender<NodeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<T, C, L, S, M> NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        seed_members: BTreeSet<NodeId>,
        transport: Arc<T>,
        clock: Arc<C>,
        log_store: Arc<L>,
        state_store: Arc<S>,
        state_machine: Arc<M>,
        rx_api: mpsc::UnboundedReceiver<(NodeMsg, Span)>,
        tx_metrics: watch::Sender<NodeMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<(), FatalError>> {
        let retry = Arc::new(RetryEngine::new(&config));
        let this = Self {
            id,
            config,
            membership: ClusterConfig::default(),
            seed_members,
            transport,
            clock,
            log_store,
            state_store,
            state_machine,
            retry,
            target_role: Role::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_last: LogId::default(),
            bytes_since_snapshot: 0,
            snapshot_seq: 0,
            installing: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the consensus protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> Result<(), FatalError> {
        tracing::debug!("node is initializing");

        let state = self.state_store.load().await.map_err(|err| self.fatal(err))?;
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;

        if let Some(snapshot) = self.state_store.load_snapshot().await.map_err(|err| self.fatal(err))? {
            self.state_machine
                .restore(&snapshot.data)
                .await
                .map_err(|err| self.fatal_restore(err))?;
            self.snapshot_last = snapshot.meta.last_included;
            self.last_applied = snapshot.meta.last_included;
            // Everything in the snapshot is committed; entries beyond it are
            // re-established through the protocol.
            self.commit_index = snapshot.meta.last_included.index;
            self.membership = snapshot.meta.configuration;
        }

        self.last_log_id = self.log_store.last_log_id().await.map_err(|err| self.fatal(err))?;

        // The newest configuration entry in the log supersedes the snapshot's.
        let first = self.log_store.first_index().await.map_err(|err| self.fatal(err))?;
        if self.last_log_id.index >= first {
            let entries = self
                .log_store
                .entries(first, self.last_log_id.index + 1)
                .await
                .map_err(|err| self.fatal(err))?;
            for entry in entries {
                if let crate::message::EntryPayload::Configuration(cfg) = entry.payload {
                    self.membership = cfg;
                }
            }
        }

        // A pristine store adopts the seed configuration.
        if self.membership.nodes.is_empty() && self.membership.old_nodes.is_none() {
            self.membership = ClusterConfig::uniform(self.seed_members.clone());
        }

        self.update_next_election_timeout(false);
        self.report_metrics();
        tracing::debug!(id = self.id, term = self.current_term, last_log=%self.last_log_id, "node initialized");

        loop {
            match &self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Follower => FollowerState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!(id = self.id, "node has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the node.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(NodeMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            configuration: self.membership.clone(),
            snapshot_last_index: self.snapshot_last.index,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the node's current term and vote to the state store.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn persist_state(&mut self) -> Result<(), FatalError> {
        let state = PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.state_store.save(&state).await.map_err(|err| self.fatal(err))
    }

    fn set_target_role(&mut self, role: Role) {
        self.target_role = role;
    }

    /// Get the next election deadline, generating a new one if unset.
    fn next_election_deadline(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = tokio::time::Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = self.clock.now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Re-arm the election timer with a fresh random timeout.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let t = tokio::time::Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(self.clock.now() + t);
        if heartbeat {
            tracing::trace!(id = self.id, "election timer reset by leader contact");
        }
    }

    /// Advance the current term, resetting the vote.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Record a non-recoverable storage error and head for shutdown.
    fn fatal(&mut self, err: StorageError) -> FatalError {
        tracing::error!(error=%err, id=self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        FatalError::Storage(err)
    }

    /// Record a non-recoverable snapshot restore error and head for shutdown.
    fn fatal_restore(&mut self, err: StateMachineError) -> FatalError {
        tracing::error!(error=%err, id=self.id, "fatal snapshot restore error, shutting down");
        self.set_target_role(Role::Shutdown);
        FatalError::Restore(err)
    }

    /// Handle one API message while not leader: RPCs are served, client
    /// operations are redirected.
    async fn handle_non_leader_msg(&mut self, msg: NodeMsg, span: Span) {
        match msg {
            NodeMsg::AppendEntries { rpc, tx } => {
                if let Ok(resp) = self.handle_append_entries_request(rpc).instrument(span).await {
                    let _ = tx.send(resp);
                }
            }
            NodeMsg::RequestVote { rpc, tx } => {
                if let Ok(resp) = self.handle_vote_request(rpc).instrument(span).await {
                    let _ = tx.send(resp);
                }
            }
            NodeMsg::InstallSnapshot { rpc, tx } => {
                if let Ok(resp) = self.handle_install_snapshot_request(rpc).instrument(span).await {
                    let _ = tx.send(resp);
                }
            }
            NodeMsg::SubmitCommand { tx, .. } => {
                let _ = tx.send(Err(ClientError::NotLeader {
                    leader_hint: self.current_leader,
                }));
            }
            NodeMsg::ReadState { tx, .. } => {
                let _ = tx.send(Err(ClientError::NotLeader {
                    leader_hint: self.current_leader,
                }));
            }
            NodeMsg::AddServer { tx, .. } | NodeMsg::RemoveServer { tx, .. } => {
                let _ = tx.send(Err(ClientError::NotLeader {
                    leader_hint: self.current_leader,
                }));
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The leader's view of one replication stream.
pub(self) struct ReplicaState {
    /// The highest log index known replicated on the target.
    pub match_index: LogIndex,
    /// Retire this stream once the target has replicated the given index.
    pub remove_after_commit: Option<LogIndex>,
    /// The handle to the stream's task.
    pub stream: ReplicationStream,
}

/// Volatile state specific to the leader role.
pub(self) struct LeaderState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    pub(super) core: &'a mut NodeCore<T, C, L, S, M>,
    /// Replication streams, one per peer.
    pub(super) nodes: BTreeMap<NodeId, ReplicaState>,
    /// Pending client operations awaiting commit + apply.
    pub(super) waiter: CommitWaiter,
    /// The membership change driver.
    pub(super) change: MembershipSynchronizer,

    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
}

impl<'a, T, C, L, S, M> LeaderState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    pub(self) fn new(core: &'a mut NodeCore<T, C, L, S, M>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            waiter: CommitWaiter::new(),
            change: MembershipSynchronizer::new(),
            replication_tx,
            replication_rx,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> Result<(), FatalError> {
        let term_at_election = self.core.current_term;

        let targets: Vec<_> = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|id| id != &self.core.id)
            .collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id);
        self.core.report_metrics();

        self.commit_initial_entry().await?;

        let mut tick = tokio::time::interval(tokio::time::Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.target_role.is_leader() {
                tracing::info!(id = self.core.id, to=?self.core.target_role, "leaving leader state");
                for node in self.nodes.values() {
                    let _ = node.stream.tx.send((LeaderEvent::Terminate, tracing::debug_span!("CH")));
                }
                if self.core.target_role == Role::Shutdown {
                    self.waiter.cancel_all(ClientError::ShuttingDown);
                    self.change.cancel("node is shutting down");
                } else {
                    self.waiter.cancel_all_leadership_lost(term_at_election, self.core.current_term);
                    self.change.cancel("leadership lost");
                }
                return Ok(());
            }

            tokio::select! {
                _ = tick.tick() => {
                    let now = self.core.clock.now();
                    let cancelled = self.waiter.cancel_timed_out(now);
                    if cancelled > 0 {
                        tracing::debug!(cancelled, "rejected timed-out client operations");
                    }
                    self.change.expire(now);
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    self.handle_msg(msg, span).await?;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).instrument(span).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }

    /// Spawn a replication stream to the target peer.
    fn spawn_replication_stream(&self, target: NodeId) -> ReplicaState {
        let stream = ReplicationStream::spawn(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id.index,
            self.core.commit_index,
            self.core.transport.clone(),
            self.core.clock.clone(),
            self.core.log_store.clone(),
            self.core.state_store.clone(),
            self.core.retry.clone(),
            self.replication_tx.clone(),
        );
        ReplicaState {
            match_index: 0,
            remove_after_commit: None,
            stream,
        }
    }

    /// Make sure every member of the current configuration has a stream.
    pub(super) fn spawn_missing_streams(&mut self) {
        let targets: Vec<_> = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|id| id != &self.core.id)
            .collect();
        for target in targets {
            if !self.nodes.contains_key(&target) {
                tracing::debug!(target, "spawning replication stream for new member");
                let state = self.spawn_replication_stream(target);
                self.nodes.insert(target, state);
            }
        }
    }

    async fn handle_msg(&mut self, msg: NodeMsg, span: Span) -> Result<(), FatalError> {
        match msg {
            NodeMsg::AppendEntries { rpc, tx } => {
                let resp = self.core.handle_append_entries_request(rpc).instrument(span).await?;
                let _ = tx.send(resp);
            }
            NodeMsg::RequestVote { rpc, tx } => {
                let resp = self.core.handle_vote_request(rpc).instrument(span).await?;
                let _ = tx.send(resp);
            }
            NodeMsg::InstallSnapshot { rpc, tx } => {
                let resp = self.core.handle_install_snapshot_request(rpc).instrument(span).await?;
                let _ = tx.send(resp);
            }
            NodeMsg::SubmitCommand { command, timeout, tx } => {
                self.handle_submit_command(command, timeout, tx).instrument(span).await?;
            }
            NodeMsg::ReadState { request, timeout, tx } => {
                self.handle_read_state(request, timeout, tx).instrument(span).await?;
            }
            NodeMsg::AddServer { id, timeout, tx } => {
                self.handle_add_server(id, timeout, tx).instrument(span).await?;
            }
            NodeMsg::RemoveServer { id, timeout, tx } => {
                self.handle_remove_server(id, timeout, tx).instrument(span).await?;
            }
        }
        Ok(())
    }

    /// Process an event from one of the replication streams.
    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> Result<(), FatalError> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, match_index } => {
                let mut retire = false;
                if let Some(replica) = self.nodes.get_mut(&target) {
                    if match_index > replica.match_index {
                        replica.match_index = match_index;
                    }
                    if let Some(threshold) = replica.remove_after_commit {
                        if replica.match_index >= threshold {
                            retire = true;
                        }
                    }
                }
                if retire {
                    tracing::debug!(target, "retiring replication stream for removed member");
                    if let Some(replica) = self.nodes.remove(&target) {
                        let _ = replica.stream.tx.send((LeaderEvent::Terminate, tracing::debug_span!("CH")));
                    }
                }
                self.try_advance_commit().await?;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(target, term, "observed higher term from peer, stepping down");
                    self.core.update_current_term(term, None);
                    self.core.persist_state().await?;
                    self.core.current_leader = None;
                    self.core.set_target_role(Role::Follower);
                    self.core.report_metrics();
                }
            }
            ReplicaEvent::Shutdown => {
                tracing::error!(id = self.core.id, "replication stream hit a fatal error");
                self.core.set_target_role(Role::Shutdown);
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The outcome a vote-collection round delivers to the candidate loop.
pub(self) type VoteOutcome = Result<Vec<(NodeId, RequestVoteResponse)>, MajorityNotReached<(NodeId, RequestVoteResponse)>>;

/// Volatile state specific to the candidate role.
pub(self) struct CandidateState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    core: &'a mut NodeCore<T, C, L, S, M>,
}

impl<'a, T, C, L, S, M> CandidateState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    pub(self) fn new(core: &'a mut NodeCore<T, C, L, S, M>) -> Self {
        Self { core }
    }

    /// Run the candidate loop. Each iteration of the outer loop is a new term.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> Result<(), FatalError> {
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            // Set up the new term.
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.current_leader = None;
            self.core.persist_state().await?;
            self.core.report_metrics();
            tracing::info!(id = self.core.id, term = self.core.current_term, "campaigning for leadership");

            let mut rx_votes = self.spawn_vote_collection();
            let mut awaiting_outcome = true;

            // Inner processing loop for this term.
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                let deadline = self.core.next_election_deadline();
                let timeout_fut = self.core.clock.sleep_until(deadline);

                tokio::select! {
                    // The election timed out; break to the outer loop for a new term.
                    _ = timeout_fut => break,
                    res = &mut rx_votes, if awaiting_outcome => {
                        awaiting_outcome = false;
                        if let Ok(outcome) = res {
                            self.handle_vote_outcome(outcome).await?;
                        }
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        self.core.handle_non_leader_msg(msg, span).await;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_role(Role::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the follower role.
pub(self) struct FollowerState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    core: &'a mut NodeCore<T, C, L, S, M>,
}

impl<'a, T, C, L, S, M> FollowerState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    pub(self) fn new(core: &'a mut NodeCore<T, C, L, S, M>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> Result<(), FatalError> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_follower() {
                return Ok(());
            }
            let deadline = self.core.next_election_deadline();
            let election_timeout = self.core.clock.sleep_until(deadline);

            tokio::select! {
                _ = election_timeout => {
                    // A node outside its own configuration never campaigns;
                    // it would only disrupt the members that remain.
                    if self.core.membership.contains(&self.core.id) {
                        self.core.set_target_role(Role::Candidate);
                    } else {
                        self.core.update_next_election_timeout(false);
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    self.core.handle_non_leader_msg(msg, span).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}
