//! An async Raft consensus engine.
//!
//! The crate is organized around a single actor task per node ([`node::Node`]
//! spawns it) which owns all mutable consensus state, plus a small set of
//! supporting components: the [`retry::RetryEngine`] for classified RPC
//! retries, the [`collector::ResponseSet`] for majority/all-with-timeout
//! aggregation of peer responses, the [`waiter::CommitWaiter`] binding client
//! futures to log indices, and the two-phase joint-consensus membership
//! synchronizer. Storage, state machine, transport and clock are plug-in
//! traits; see [`storage`], [`network`] and [`clock`].

pub mod clock;
pub mod collector;
pub mod config;
mod core;
pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod node;
mod quorum;
pub mod retry;
pub mod storage;
pub mod waiter;

mod membership;
mod replication;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use crate::clock::Clock;
pub use crate::clock::TokioClock;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::RetryPolicy;
pub use crate::core::Role;
pub use crate::error::ClientError;
pub use crate::error::ConfigError;
pub use crate::error::StateMachineError;
pub use crate::error::StorageError;
pub use crate::membership::ChangePhase;
pub use crate::metrics::NodeMetrics;
pub use crate::network::Transport;
pub use crate::network::TransportError;
pub use crate::node::Node;
pub use crate::storage::LogStore;
pub use crate::storage::StateMachine;
pub use crate::storage::StateStore;

// Re-exported for the convenience of trait implementors.
pub use async_trait::async_trait;

/// A Raft node's ID.
pub type NodeId = u64;

/// A Raft election term. Term `0` is the pre-election sentinel.
pub type Term = u64;

/// An index into the replicated log. Valid entries start at `1`; `0` denotes "before the log".
pub type LogIndex = u64;

/// The identity of a log entry: the term in which it was created and its index in the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl LogId {
    pub fn new(term: Term, index: LogIndex) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.term, self.index)
    }
}

/// A compact, single-line rendering of a message for tracing output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
