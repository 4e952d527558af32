//! Wire-visible data types: log entries, cluster configurations and the three RPC pairs.
//!
//! Serialization is plug-in: every type here derives serde's traits so that
//! any transport can frame it however it likes. Correctness only requires
//! that each field round-trips.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::quorum;
use crate::LogId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// A single entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty entry committed by a new cluster leader to settle entries from prior terms.
    Noop,
    /// An opaque state-machine command submitted by a client.
    Command(Vec<u8>),
    /// A cluster membership configuration.
    Configuration(ClusterConfig),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Noop => "noop".to_string(),
            EntryPayload::Command(data) => format!("command({}B)", data.len()),
            EntryPayload::Configuration(cfg) => format!("config: {:?}", cfg),
        }
    }
}

/// The membership configuration of the cluster.
///
/// While a two-phase membership change is underway the configuration is
/// *joint*: `old_nodes` holds the previous member set and every decision
/// (commit, election) requires a majority in `nodes` **and** in `old_nodes`.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All voting members of the cluster.
    pub nodes: BTreeSet<NodeId>,
    /// The prior member set, present only while in joint consensus.
    pub old_nodes: Option<BTreeSet<NodeId>>,
}

impl ClusterConfig {
    /// Create a new uniform config from the given member set.
    pub fn uniform(nodes: BTreeSet<NodeId>) -> Self {
        Self { nodes, old_nodes: None }
    }

    /// Build the joint config which transitions `current` towards `target`.
    ///
    /// `nodes` holds the target set and `old_nodes` the departing one, so a
    /// successor leader finding this entry in its log can reconstruct the
    /// final configuration. A node being removed keeps voting through
    /// `old_nodes` until the change is final.
    pub fn joint(current: &ClusterConfig, target: &BTreeSet<NodeId>) -> Self {
        Self {
            nodes: target.clone(),
            old_nodes: Some(current.nodes.clone()),
        }
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_joint(&self) -> bool {
        self.old_nodes.is_some()
    }

    /// Get the set of every node named by this config, across both groups.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.nodes.clone();
        if let Some(old) = &self.old_nodes {
            all.extend(old);
        }
        all
    }

    /// Check if the given node exists in this config.
    ///
    /// When in joint consensus, both groups are checked.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains(id) || self.old_nodes.as_ref().map(|old| old.contains(id)).unwrap_or(false)
    }

    /// Check whether the given set of acknowledging nodes forms a quorum.
    ///
    /// A joint config requires a majority in each group.
    pub fn has_quorum(&self, acked: &BTreeSet<NodeId>) -> bool {
        let group_ok = |group: &BTreeSet<NodeId>| {
            let count = group.iter().filter(|id| acked.contains(id)).count();
            count >= quorum::majority_of(group.len())
        };
        group_ok(&self.nodes) && self.old_nodes.as_ref().map(|old| group_ok(old)).unwrap_or(true)
    }
}

/// The durably persisted election state of a node.
///
/// Both fields must be on stable storage before any RPC response which
/// depends on them is sent.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct PersistentState {
    /// The last term this node has observed.
    pub current_term: Term,
    /// The candidate this node voted for in `current_term`, if any.
    pub voted_for: Option<NodeId>,
}

/// Metadata describing a snapshot of the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The id of the last log entry covered by this snapshot, inclusive.
    pub last_included: LogId,
    /// The membership configuration as of `last_included`.
    pub configuration: ClusterConfig,
    /// Distinguishes transfers: two snapshots with the same `last_included`
    /// may still differ in bytes.
    pub snapshot_id: String,
}

/// A complete snapshot: metadata plus the serialized state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

impl MessageSummary for RequestVoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `RequestVoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: Term,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the cluster leader to replicate log entries, and as a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: LogIndex,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// The new log entries to store. Empty for heartbeats.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev=({},{}), leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
///
/// On a consistency-check failure the `conflict_index`/`conflict_term` pair
/// lets the leader step `next_index` back over a whole conflicting term at
/// once instead of one entry per round trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower contained an entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// The first index of the conflicting term, or the follower's `last_index + 1`
    /// if its log is too short. Only present when `success` is false.
    pub conflict_index: Option<LogIndex>,
    /// The conflicting term, or `None` if the follower's log is too short.
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResponse {
    pub fn success(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// An RPC sent by the leader to stream chunks of a snapshot to a follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// Snapshot metadata: last included log id, configuration and transfer id.
    pub meta: SnapshotMeta,
    /// The byte offset where this chunk is positioned in the snapshot payload.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// Will be `true` if this is the last chunk of the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last_included={}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta.last_included,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for the leader to update itself.
    pub term: Term,
}
