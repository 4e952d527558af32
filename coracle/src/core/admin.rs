use std::collections::BTreeSet;

use tokio::time::Duration;

use crate::clock::Clock;
use crate::core::LeaderState;
use crate::core::Role;
use crate::error::ClientError;
use crate::error::FatalError;
use crate::membership::ChangeAction;
use crate::membership::ChangePhase;
use crate::membership::ChangeResponseTx;
use crate::message::ClusterConfig;
use crate::message::EntryPayload;
use crate::network::Transport;
use crate::replication::LeaderEvent;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::LogIndex;
use crate::NodeId;

impl<'a, T, C, L, S, M> LeaderState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Commit the entry every new leader is obligated to create on taking
    /// power: committing it settles all entries from prior terms.
    ///
    /// Three shapes:
    /// - a pristine cluster gets its seed configuration as entry 1, making
    ///   the configuration durable in the log;
    /// - a log ending in a joint configuration means the previous leader
    ///   died mid-change, so the final configuration is appended to drive
    ///   the change to completion;
    /// - otherwise, a no-op.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_entry(&mut self) -> Result<(), FatalError> {
        let last = self.core.last_log_id.index;

        if last == 0 {
            let seed = self.core.membership.clone();
            let entry = self.append_payload(EntryPayload::Configuration(seed)).await?;
            tracing::debug!(index = entry.log_id.index, "appended initial configuration entry");
            return self.replicate_appended().await;
        }

        let tail = if last > self.core.snapshot_last.index {
            self.core.log_store.try_entry(last).await.map_err(|err| self.core.fatal(err))?
        } else {
            None
        };

        if let Some(entry) = tail {
            if let EntryPayload::Configuration(cfg) = entry.payload {
                if cfg.is_joint() {
                    tracing::info!("completing membership change interrupted by leadership change");
                    let final_config = ClusterConfig::uniform(cfg.nodes.clone());
                    let entry = self.append_payload(EntryPayload::Configuration(final_config.clone())).await?;
                    self.change.resume(final_config, entry.log_id.index);
                    self.spawn_missing_streams();
                    return self.replicate_appended().await;
                }
            }
        }

        let entry = self.append_payload(EntryPayload::Noop).await?;
        tracing::debug!(index = entry.log_id.index, "appended no-op entry for new term");
        self.replicate_appended().await
    }

    /// Handle an `add_server` request.
    #[tracing::instrument(level = "debug", skip(self, timeout, tx), fields(target=id))]
    pub(super) async fn handle_add_server(
        &mut self,
        id: NodeId,
        timeout: Duration,
        tx: ChangeResponseTx,
    ) -> Result<(), FatalError> {
        let current = self.core.membership.clone();
        if current.is_joint() {
            let _ = tx.send(Err(ClientError::ChangeInProgress));
            return Ok(());
        }
        let mut target = current.nodes.clone();
        if !target.insert(id) {
            // Already a member; nothing to change.
            let _ = tx.send(Ok(false));
            return Ok(());
        }
        self.start_change(current, target, timeout, tx).await
    }

    /// Handle a `remove_server` request.
    #[tracing::instrument(level = "debug", skip(self, timeout, tx), fields(target=id))]
    pub(super) async fn handle_remove_server(
        &mut self,
        id: NodeId,
        timeout: Duration,
        tx: ChangeResponseTx,
    ) -> Result<(), FatalError> {
        let current = self.core.membership.clone();
        if current.is_joint() {
            let _ = tx.send(Err(ClientError::ChangeInProgress));
            return Ok(());
        }
        let mut target = current.nodes.clone();
        if !target.remove(&id) {
            let _ = tx.send(Ok(false));
            return Ok(());
        }
        if target.is_empty() {
            let _ = tx.send(Err(ClientError::ConfigurationChange {
                phase: ChangePhase::Joint,
                reason: "resulting configuration would be empty".to_string(),
            }));
            return Ok(());
        }
        self.start_change(current, target, timeout, tx).await
    }

    /// Append the joint configuration and begin waiting for its commit.
    async fn start_change(
        &mut self,
        current: ClusterConfig,
        target: BTreeSet<NodeId>,
        timeout: Duration,
        tx: ChangeResponseTx,
    ) -> Result<(), FatalError> {
        let deadline = self.core.clock.now() + timeout;
        let joint = match self.change.begin(&current, target, tx, deadline) {
            Some(joint) => joint,
            None => return Ok(()),
        };
        tracing::info!(?joint, "starting membership change");

        let entry = self.append_payload(EntryPayload::Configuration(joint)).await?;
        self.change.joint_appended(entry.log_id.index);
        // New members start replicating immediately, while still in the
        // joint phase.
        self.spawn_missing_streams();
        self.replicate_appended().await
    }

    /// A configuration entry has committed: advance the change protocol and
    /// apply post-commit bookkeeping.
    pub(super) async fn handle_config_committed(
        &mut self,
        index: LogIndex,
        config: ClusterConfig,
    ) -> Result<(), FatalError> {
        match self.change.notify_committed(&config, index) {
            ChangeAction::AppendFinal(final_config) => {
                tracing::info!(?final_config, "joint configuration committed, appending final");
                let entry = self.append_payload(EntryPayload::Configuration(final_config)).await?;
                self.change.final_appended(entry.log_id.index);
                // The caller's commit loop picks the new entry up; calling
                // back into it from here would recurse.
                self.notify_streams_of_append();
            }
            ChangeAction::Completed(tx) => {
                tracing::info!(index, "membership change complete");
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(true));
                }
                self.finalize_committed_config(index);
            }
            ChangeAction::None => {
                // A configuration not driven by our synchronizer (e.g. one
                // inherited from a prior term) still needs its bookkeeping.
                if !config.is_joint() {
                    self.finalize_committed_config(index);
                }
            }
        }
        Ok(())
    }

    /// Post-commit bookkeeping for a uniform configuration: step down after
    /// self-removal, retire streams to departed members.
    fn finalize_committed_config(&mut self, index: LogIndex) {
        if !self.core.membership.contains(&self.core.id) {
            tracing::info!(id = self.core.id, "stepping down after committed self-removal");
            self.core.current_leader = None;
            self.core.set_target_role(Role::Follower);
            return;
        }

        let membership = self.core.membership.clone();
        let mut departed = Vec::new();
        for (target, replica) in self.nodes.iter_mut() {
            if membership.contains(target) {
                continue;
            }
            if replica.match_index >= index {
                departed.push(*target);
            } else {
                // Let the departing member learn of its removal before its
                // stream is torn down.
                replica.remove_after_commit = Some(index);
            }
        }
        for target in departed {
            tracing::debug!(target, "removing replication stream for departed member");
            if let Some(replica) = self.nodes.remove(&target) {
                let _ = replica.stream.tx.send((LeaderEvent::Terminate, tracing::debug_span!("CH")));
            }
        }
        self.core.report_metrics();
    }
}
