//! The two-phase joint-consensus membership change driver.
//!
//! A change moves the cluster from its current configuration to a target
//! member set through an intermediate joint configuration. Each phase is a
//! configuration entry in the log, and the next phase starts only once the
//! previous entry has committed under the double-majority rule. At most one
//! change runs at a time.

use std::collections::BTreeSet;
use std::fmt;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::message::ClusterConfig;
use crate::LogIndex;
use crate::NodeId;

/// Which phase of a membership change was active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangePhase {
    Joint,
    Final,
}

impl fmt::Display for ChangePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChangePhase::Joint => write!(f, "joint"),
            ChangePhase::Final => write!(f, "final"),
        }
    }
}

/// The channel resolving an `add_server` / `remove_server` call.
pub(crate) type ChangeResponseTx = oneshot::Sender<Result<bool, ClientError>>;

enum ChangeState {
    Idle,
    WaitingJoint {
        joint: ClusterConfig,
        target: BTreeSet<NodeId>,
        joint_index: LogIndex,
        tx: ChangeResponseTx,
        deadline: Instant,
    },
    WaitingFinal {
        final_config: ClusterConfig,
        final_index: LogIndex,
        /// Absent when a successor leader is completing a change it
        /// inherited from its log; the original caller's future was already
        /// rejected with `LeadershipLost` on the old leader.
        tx: Option<ChangeResponseTx>,
        deadline: Option<Instant>,
    },
}

/// What the leader must do after a configuration entry committed.
pub(crate) enum ChangeAction {
    /// Nothing; the committed entry is not part of a tracked change.
    None,
    /// The joint entry committed: append the final configuration.
    AppendFinal(ClusterConfig),
    /// The final entry committed: the change is complete.
    Completed(Option<ChangeResponseTx>),
}

/// Serializes and sequences membership changes on the leader.
pub(crate) struct MembershipSynchronizer {
    state: ChangeState,
}

impl MembershipSynchronizer {
    pub fn new() -> Self {
        Self { state: ChangeState::Idle }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ChangeState::Idle)
    }

    /// Start a change towards `target`, returning the joint configuration
    /// to append. If a change is already running the caller's future is
    /// rejected with `ChangeInProgress` and `None` is returned.
    pub fn begin(
        &mut self,
        current: &ClusterConfig,
        target: BTreeSet<NodeId>,
        tx: ChangeResponseTx,
        deadline: Instant,
    ) -> Option<ClusterConfig> {
        if !self.is_idle() {
            let _ = tx.send(Err(ClientError::ChangeInProgress));
            return None;
        }
        let joint = ClusterConfig::joint(current, &target);
        self.state = ChangeState::WaitingJoint {
            joint: joint.clone(),
            target,
            // Recorded via `joint_appended` once the entry has a log index.
            joint_index: 0,
            tx,
            deadline,
        };
        Some(joint)
    }

    /// Record the log index the joint entry landed at.
    pub fn joint_appended(&mut self, index: LogIndex) {
        if let ChangeState::WaitingJoint { joint_index, .. } = &mut self.state {
            *joint_index = index;
        }
    }

    /// Record the log index the final entry landed at.
    pub fn final_appended(&mut self, index: LogIndex) {
        if let ChangeState::WaitingFinal { final_index, .. } = &mut self.state {
            *final_index = index;
        }
    }

    /// A configuration entry has committed; advance the change if it is ours.
    pub fn notify_committed(&mut self, config: &ClusterConfig, index: LogIndex) -> ChangeAction {
        match std::mem::replace(&mut self.state, ChangeState::Idle) {
            ChangeState::WaitingJoint {
                joint,
                target,
                joint_index,
                tx,
                deadline,
            } => {
                if joint_index == index && &joint == config {
                    let final_config = ClusterConfig::uniform(target);
                    self.state = ChangeState::WaitingFinal {
                        final_config: final_config.clone(),
                        final_index: 0,
                        tx: Some(tx),
                        deadline: Some(deadline),
                    };
                    ChangeAction::AppendFinal(final_config)
                } else {
                    self.state = ChangeState::WaitingJoint {
                        joint,
                        target,
                        joint_index,
                        tx,
                        deadline,
                    };
                    ChangeAction::None
                }
            }
            ChangeState::WaitingFinal {
                final_config,
                final_index,
                tx,
                deadline,
            } => {
                if final_index == index && &final_config == config {
                    ChangeAction::Completed(tx)
                } else {
                    self.state = ChangeState::WaitingFinal {
                        final_config,
                        final_index,
                        tx,
                        deadline,
                    };
                    ChangeAction::None
                }
            }
            ChangeState::Idle => ChangeAction::None,
        }
    }

    /// Synthesize the final phase of a change inherited from the log: the
    /// previous leader committed (or at least appended) the joint entry but
    /// not the final one. There is no caller to respond to.
    pub fn resume(&mut self, final_config: ClusterConfig, final_index: LogIndex) {
        self.state = ChangeState::WaitingFinal {
            final_config,
            final_index,
            tx: None,
            deadline: None,
        };
    }

    /// Abort any running change, rejecting its future with the phase it
    /// died in.
    pub fn cancel(&mut self, reason: &str) {
        match std::mem::replace(&mut self.state, ChangeState::Idle) {
            ChangeState::Idle => {}
            ChangeState::WaitingJoint { tx, .. } => {
                let _ = tx.send(Err(ClientError::ConfigurationChange {
                    phase: ChangePhase::Joint,
                    reason: reason.to_string(),
                }));
            }
            ChangeState::WaitingFinal { tx, .. } => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ClientError::ConfigurationChange {
                        phase: ChangePhase::Final,
                        reason: reason.to_string(),
                    }));
                }
            }
        }
    }

    /// Cancel the running change if its deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let expired = match &self.state {
            ChangeState::WaitingJoint { deadline, .. } => *deadline <= now,
            ChangeState::WaitingFinal {
                deadline: Some(deadline),
                ..
            } => *deadline <= now,
            _ => false,
        };
        if expired {
            self.cancel("membership change timed out");
        }
    }
}
