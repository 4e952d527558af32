use std::collections::BTreeSet;

use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::clock::Clock;
use crate::collector::ResponseSet;
use crate::core::CandidateState;
use crate::core::NodeCore;
use crate::core::Role;
use crate::core::VoteOutcome;
use crate::error::FatalError;
use crate::message::RequestVoteRequest;
use crate::message::RequestVoteResponse;
use crate::network::Transport;
use crate::quorum;
use crate::retry::OP_REQUEST_VOTE;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::MessageSummary;
use crate::NodeId;

impl<T, C, L, S, M> NodeCore<T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Handle an inbound RequestVote RPC.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(
        &mut self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, FatalError> {
        if req.term < self.current_term {
            tracing::debug!(req_term = req.term, "rejecting vote request from stale term");
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.persist_state().await?;
            self.current_leader = None;
            self.set_target_role(Role::Follower);
            self.report_metrics();
        }

        // Grant iff no conflicting vote exists for this term and the
        // candidate's log is at least as up-to-date as ours.
        let candidate_up_to_date = (req.last_log_term, req.last_log_index) >= (self.last_log_id.term, self.last_log_id.index);
        let vote_free = match &self.voted_for {
            None => true,
            Some(candidate) => candidate == &req.candidate_id,
        };

        if !(candidate_up_to_date && vote_free) {
            tracing::debug!(
                candidate = req.candidate_id,
                up_to_date = candidate_up_to_date,
                voted_for = ?self.voted_for,
                "vote denied"
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if self.voted_for != Some(req.candidate_id) {
            self.voted_for = Some(req.candidate_id);
            self.persist_state().await?;
        }
        self.update_next_election_timeout(false);
        tracing::debug!(candidate = req.candidate_id, term = self.current_term, "vote granted");
        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}

impl<'a, T, C, L, S, M> CandidateState<'a, T, C, L, S, M>
where
    T: Transport,
    C: Clock,
    L: LogStore,
    S: StateStore,
    M: StateMachine,
{
    /// Fan a RequestVote out to every peer, collecting responses through a
    /// majority collection in a background task. The candidate's own vote is
    /// implicit; the threshold only counts peers.
    pub(super) fn spawn_vote_collection(&mut self) -> oneshot::Receiver<VoteOutcome> {
        let core = &*self.core;
        let membership = core.membership.clone();
        let peers: Vec<NodeId> = membership.all_nodes().into_iter().filter(|id| id != &core.id).collect();

        let group_needed = |group: &BTreeSet<NodeId>| -> usize {
            quorum::majority_of(group.len()).saturating_sub(group.contains(&core.id) as usize)
        };
        let mut needed = group_needed(&membership.nodes);
        if let Some(old) = &membership.old_nodes {
            needed = needed.max(group_needed(old));
        }
        let needed = needed.min(peers.len());

        let rpc = RequestVoteRequest {
            term: core.current_term,
            candidate_id: core.id,
            last_log_index: core.last_log_id.index,
            last_log_term: core.last_log_id.term,
        };
        let rpc_ttl = core.retry.effective_timeout(Duration::from_millis(core.config.request_vote_timeout));
        let collection_ttl = Duration::from_millis(core.config.election_timeout_min);

        let futures: Vec<_> = peers
            .into_iter()
            .map(|peer| {
                let transport = core.transport.clone();
                let clock = core.clock.clone();
                let retry = core.retry.clone();
                let rpc = rpc.clone();
                async move {
                    retry
                        .execute(OP_REQUEST_VOTE, clock.as_ref(), || {
                            let transport = transport.clone();
                            let rpc = rpc.clone();
                            async move { transport.send_request_vote(peer, rpc, rpc_ttl).await }
                        })
                        .await
                        .map(|resp| (peer, resp))
                }
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(
            async move {
                let set = ResponseSet::new(futures);
                let outcome = set.majority(needed, collection_ttl).await;
                let _ = tx.send(outcome);
            }
            .instrument(tracing::debug_span!("vote-collection")),
        );
        rx
    }

    /// Evaluate the collected vote responses for the current term.
    pub(super) async fn handle_vote_outcome(&mut self, outcome: VoteOutcome) -> Result<(), FatalError> {
        let responses = match outcome {
            Ok(responses) => responses,
            Err(partial) => partial.responses,
        };

        // Any higher term deposes us regardless of the vote tally.
        for (peer, resp) in &responses {
            if resp.term > self.core.current_term {
                tracing::info!(peer, term = resp.term, "observed higher term in vote response, stepping down");
                self.core.update_current_term(resp.term, None);
                self.core.persist_state().await?;
                self.core.set_target_role(Role::Follower);
                self.core.report_metrics();
                return Ok(());
            }
        }

        let granted: BTreeSet<NodeId> = responses
            .iter()
            .filter(|(_, resp)| resp.vote_granted && resp.term == self.core.current_term)
            .map(|(peer, _)| *peer)
            .chain(std::iter::once(self.core.id))
            .collect();

        if self.core.membership.has_quorum(&granted) {
            tracing::info!(
                id = self.core.id,
                term = self.core.current_term,
                votes = granted.len(),
                "won election"
            );
            self.core.set_target_role(Role::Leader);
        } else {
            tracing::debug!(
                id = self.core.id,
                votes = granted.len(),
                "election round inconclusive, awaiting timer"
            );
        }
        Ok(())
    }
}
