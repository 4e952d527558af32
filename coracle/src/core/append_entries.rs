use crate::clock::Clock;
use crate::core::NodeCore;
use crate::core::Role;
use crate::error::FatalError;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::EntryPayload;
use crate::network::Transport;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::MessageSummary;
use crate::Term;

impl<T, C, L, S, M> NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Handle an inbound AppendEntries RPC.
    ///
    /// Every state mutation is durable before the response is sent; the
    /// reply is the acknowledgment.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, FatalError> {
        // A request from a stale term is rejected without touching the
        // election timer.
        if req.term < self.current_term {
            tracing::debug!(req_term = req.term, "rejecting AppendEntries from stale term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.persist_state().await?;
        }

        // A valid leader for the current term exists.
        if !self.target_role.is_follower() {
            self.set_target_role(Role::Follower);
        }
        self.update_next_election_timeout(true);
        if self.current_leader != Some(req.leader_id) {
            self.current_leader = Some(req.leader_id);
        }

        // Log consistency check.
        if req.prev_log_index > 0 {
            match self.local_term_at(req.prev_log_index, req.prev_log_term).await? {
                None => {
                    // Log too short: tell the leader where it ends.
                    let conflict_index = self.last_log_id.index + 1;
                    tracing::debug!(conflict_index, "consistency check failed, log too short");
                    self.report_metrics();
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: None,
                    });
                }
                Some(local_term) if local_term != req.prev_log_term => {
                    let conflict_index = self.first_index_of_term(req.prev_log_index, local_term).await?;
                    tracing::debug!(
                        conflict_index,
                        conflict_term = local_term,
                        "consistency check failed, conflicting term"
                    );
                    self.report_metrics();
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: Some(local_term),
                    });
                }
                Some(_) => {}
            }
        }

        // Find the first genuinely new entry, truncating a conflicting
        // suffix if one exists. Re-sending an already-appended prefix is a
        // no-op.
        let mut append_from = None;
        for (i, entry) in req.entries.iter().enumerate() {
            let index = entry.log_id.index;
            if index <= self.snapshot_last.index {
                continue;
            }
            if index > self.last_log_id.index {
                append_from = Some(i);
                break;
            }
            let existing = self.log_store.try_entry(index).await.map_err(|err| self.fatal(err))?;
            let matches = existing.map(|e| e.log_id.term == entry.log_id.term).unwrap_or(false);
            if !matches {
                tracing::debug!(index, "truncating conflicting suffix");
                self.log_store.truncate_suffix(index).await.map_err(|err| self.fatal(err))?;
                self.last_log_id = self.log_store.last_log_id().await.map_err(|err| self.fatal(err))?;
                append_from = Some(i);
                break;
            }
        }
        if let Some(i) = append_from {
            let new_entries = &req.entries[i..];
            self.log_store.append(new_entries).await.map_err(|err| self.fatal(err))?;
            if let Some(last) = new_entries.last() {
                self.last_log_id = last.log_id;
            }
            for entry in new_entries {
                if let EntryPayload::Configuration(cfg) = &entry.payload {
                    self.membership = cfg.clone();
                }
            }
        }

        // Commit advancement: with no new entries, the request vouches for
        // the log only up to prev_log_index.
        let last_new = req.entries.last().map(|e| e.log_id.index).unwrap_or(req.prev_log_index);
        let new_commit = req.leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }
        if self.commit_index > self.last_applied.index {
            self.apply_committed_entries(None).await?;
            self.maybe_snapshot().await?;
        }

        self.report_metrics();
        Ok(AppendEntriesResponse::success(self.current_term))
    }

    /// The local term at `index`, or `None` if the log has no entry there.
    ///
    /// Indices at or below the snapshot boundary are committed and known to
    /// match the leader, so they answer with the leader's own term.
    async fn local_term_at(&mut self, index: u64, leaders_term_there: Term) -> Result<Option<Term>, FatalError> {
        if self.snapshot_last.index > 0 && index == self.snapshot_last.index {
            return Ok(Some(self.snapshot_last.term));
        }
        if index < self.snapshot_last.index {
            return Ok(Some(leaders_term_there));
        }
        if index > self.last_log_id.index {
            return Ok(None);
        }
        let entry = self.log_store.try_entry(index).await.map_err(|err| self.fatal(err))?;
        Ok(entry.map(|e| e.log_id.term))
    }

    /// Walk back to the first retained entry of `term`, starting at `from`.
    async fn first_index_of_term(&mut self, from: u64, term: Term) -> Result<u64, FatalError> {
        let floor = self.snapshot_last.index + 1;
        let mut index = from;
        while index > floor && index > 1 {
            let prior = self.log_store.try_entry(index - 1).await.map_err(|err| self.fatal(err))?;
            match prior {
                Some(e) if e.log_id.term == term => index -= 1,
                _ => break,
            }
        }
        Ok(index)
    }
}
