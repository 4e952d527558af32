//! The public interface to a running consensus node.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::Span;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::NodeCore;
use crate::error::ClientError;
use crate::error::FatalError;
use crate::error::Shutdown;
use crate::membership::ChangeResponseTx;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::RequestVoteRequest;
use crate::message::RequestVoteResponse;
use crate::metrics::NodeMetrics;
use crate::metrics::Wait;
use crate::network::Transport;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::storage::StateStore;
use crate::waiter::OpResponseTx;
use crate::MessageSummary;
use crate::NodeId;

struct NodeInner {
    tx_api: mpsc::UnboundedSender<(NodeMsg, Span)>,
    rx_metrics: watch::Receiver<NodeMetrics>,
    core_handle: Mutex<Option<JoinHandle<Result<(), FatalError>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A handle to a running consensus node.
///
/// Creating a `Node` spawns the consensus core as a dedicated task which
/// owns all mutable state; this handle is a thin channel front-end and may
/// be cloned liberally.
///
/// The three RPC entry points (`append_entries`, `vote`, `install_snapshot`)
/// are the inbound side of the transport: a server implementation
/// deserializes each arriving request, calls the matching method, and ships
/// the response back.
///
/// If any method returns a shutting-down error, the core has stopped
/// (possibly due to a fatal storage failure) and [`Node::shutdown`] should
/// be awaited to retrieve the cause.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create and spawn a new consensus node.
    ///
    /// `id` must be stable across restarts of this node. `seed_members` is
    /// the initial cluster configuration; it applies only when the stores
    /// are pristine, as any configuration recovered from the snapshot or
    /// log takes precedence. All nodes of a new cluster must be seeded with
    /// the same member set.
    #[tracing::instrument(level="debug", skip_all, fields(id=id, cluster=%config.cluster_name))]
    pub fn new<T, C, L, S, M>(
        id: NodeId,
        config: Arc<Config>,
        seed_members: BTreeSet<NodeId>,
        transport: Arc<T>,
        clock: Arc<C>,
        log_store: Arc<L>,
        state_store: Arc<S>,
        state_machine: Arc<M>,
    ) -> Self
    where
        T: Transport,
        C: Clock,
        L: LogStore,
        S: StateStore,
        M: StateMachine,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(NodeMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = NodeCore::spawn(
            id,
            config,
            seed_members,
            transport,
            clock,
            log_store,
            state_store,
            state_machine,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = NodeInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an inbound AppendEntries RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, Shutdown> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((NodeMsg::AppendEntries { rpc, tx }, span)).map_err(|_| Shutdown)?;
        rx.await.map_err(|_| Shutdown)
    }

    /// Submit an inbound RequestVote RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn vote(&self, rpc: RequestVoteRequest) -> Result<RequestVoteResponse, Shutdown> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((NodeMsg::RequestVote { rpc, tx }, span)).map_err(|_| Shutdown)?;
        rx.await.map_err(|_| Shutdown)
    }

    /// Submit an inbound InstallSnapshot RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, Shutdown> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((NodeMsg::InstallSnapshot { rpc, tx }, span)).map_err(|_| Shutdown)?;
        rx.await.map_err(|_| Shutdown)
    }

    /// Submit a command to the replicated state machine.
    ///
    /// The returned future resolves with the state machine's reply bytes
    /// once the command's log entry has committed and been applied. It
    /// fails with `NotLeader` when sent to a non-leader, `LeadershipLost`
    /// if this node is deposed first, `CommitTimeout` when `timeout`
    /// expires, or `ApplicationFailed` if the state machine rejects the
    /// command.
    #[tracing::instrument(level = "debug", skip(self, command, timeout), fields(len=command.len()))]
    pub async fn submit_command(&self, command: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((NodeMsg::SubmitCommand { command, timeout, tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    /// Perform a linearizable read against the state machine.
    ///
    /// The read observes the effect of every command committed before this
    /// call was issued: the leader confirms its leadership with a majority
    /// heartbeat round before answering the query from the state machine.
    #[tracing::instrument(level = "debug", skip(self, request, timeout))]
    pub async fn read_state(&self, request: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((NodeMsg::ReadState { request, timeout, tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    /// Add a node to the cluster through a joint-consensus change.
    ///
    /// Resolves `true` once the final configuration has committed, `false`
    /// if the node was already a member.
    #[tracing::instrument(level = "debug", skip(self, timeout), fields(target=id))]
    pub async fn add_server(&self, id: NodeId, timeout: Duration) -> Result<bool, ClientError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((NodeMsg::AddServer { id, timeout, tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    /// Remove a node from the cluster through a joint-consensus change.
    ///
    /// Resolves `true` once the final configuration has committed, `false`
    /// if the node was not a member. A leader removing itself steps down
    /// once the final configuration commits.
    #[tracing::instrument(level = "debug", skip(self, timeout), fields(target=id))]
    pub async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<bool, ClientError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((NodeMsg::RemoveServer { id, timeout, tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    /// The node's current status: role, term, leader, commit/apply indices
    /// and configuration.
    pub fn status(&self) -> NodeMetrics {
        self.inner.rx_metrics.borrow().clone()
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<NodeMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut down this node, awaiting the core task's exit.
    pub async fn shutdown(&self) -> Result<(), FatalError> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            if let Ok(res) = handle.await {
                res?;
            }
        }
        Ok(())
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A message from the node handle to the core task.
pub(crate) enum NodeMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        rpc: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<InstallSnapshotResponse>,
    },
    SubmitCommand {
        command: Vec<u8>,
        timeout: Duration,
        tx: OpResponseTx,
    },
    ReadState {
        request: Vec<u8>,
        timeout: Duration,
        tx: OpResponseTx,
    },
    AddServer {
        id: NodeId,
        timeout: Duration,
        tx: ChangeResponseTx,
    },
    RemoveServer {
        id: NodeId,
        timeout: Duration,
        tx: ChangeResponseTx,
    },
}
