use crate::clock::Clock;
use crate::core::NodeCore;
use crate::core::Role;
use crate::core::SnapshotInstall;
use crate::error::FatalError;
use crate::error::StorageError;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::Snapshot;
use crate::network::Transport;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::MessageSummary;

impl<T, C, L, S, M> NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Handle an inbound InstallSnapshot RPC.
    ///
    /// Chunks are assembled contiguously from offset 0. A chunk at offset 0
    /// always starts a fresh assembly, which is what makes leader-side
    /// restart-from-zero safe after an interrupted transfer.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, FatalError> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.persist_state().await?;
        }
        if !self.target_role.is_follower() {
            self.set_target_role(Role::Follower);
        }
        self.update_next_election_timeout(true);
        if self.current_leader != Some(req.leader_id) {
            self.current_leader = Some(req.leader_id);
        }

        let continues_stream = matches!(
            &self.installing,
            Some(install) if install.id == req.meta.snapshot_id && install.buf.len() as u64 == req.offset
        );
        if req.offset == 0 {
            self.installing = Some(SnapshotInstall {
                id: req.meta.snapshot_id.clone(),
                buf: Vec::new(),
            });
        } else if !continues_stream {
            // The leader sends chunks in order and restarts at 0 after any
            // failure, so a gap means this chunk belongs to an abandoned
            // transfer.
            tracing::warn!(offset = req.offset, id = %req.meta.snapshot_id, "dropping out-of-order snapshot chunk");
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        if let Some(install) = &mut self.installing {
            install.buf.extend_from_slice(&req.data);
        }
        if !req.done {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        let install = match self.installing.take() {
            Some(install) => install,
            None => {
                return Ok(InstallSnapshotResponse {
                    term: self.current_term,
                })
            }
        };

        // A snapshot at or below our commit point is stale; accept and move on.
        if req.meta.last_included.index <= self.commit_index {
            tracing::debug!(
                last_included = req.meta.last_included.index,
                commit_index = self.commit_index,
                "ignoring stale snapshot"
            );
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        tracing::info!(
            last_included = %req.meta.last_included,
            bytes = install.buf.len(),
            "installing snapshot from leader"
        );

        let snapshot = Snapshot {
            meta: req.meta.clone(),
            data: install.buf,
        };
        self.state_store.save_snapshot(&snapshot).await.map_err(|err| self.fatal(err))?;

        // Drop any divergent suffix, then fold the covered prefix away.
        match self.log_store.try_entry(req.meta.last_included.index).await {
            Ok(Some(entry)) if entry.log_id.term == req.meta.last_included.term => {}
            Ok(_) => {
                if self.last_log_id.index > req.meta.last_included.index {
                    self.log_store
                        .truncate_suffix(req.meta.last_included.index + 1)
                        .await
                        .map_err(|err| self.fatal(err))?;
                }
            }
            Err(StorageError::Compacted { .. }) => {}
            Err(err) => return Err(self.fatal(err)),
        }
        self.log_store
            .discard_prefix(req.meta.last_included.index)
            .await
            .map_err(|err| self.fatal(err))?;
        self.last_log_id = self.log_store.last_log_id().await.map_err(|err| self.fatal(err))?;
        if self.last_log_id.index <= req.meta.last_included.index {
            // The store may not know the boundary entry's term once the
            // prefix is gone; the snapshot metadata is authoritative.
            self.last_log_id = req.meta.last_included;
        }

        self.state_machine
            .restore(&snapshot.data)
            .await
            .map_err(|err| self.fatal_restore(err))?;

        self.commit_index = req.meta.last_included.index;
        self.last_applied = req.meta.last_included;
        self.snapshot_last = req.meta.last_included;
        self.bytes_since_snapshot = 0;
        self.membership = req.meta.configuration.clone();
        self.report_metrics();

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }
}
