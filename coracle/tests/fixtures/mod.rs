//! Fixtures for testing the consensus engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use coracle::error::ClientError;
use coracle::message::AppendEntriesRequest;
use coracle::message::AppendEntriesResponse;
use coracle::message::InstallSnapshotRequest;
use coracle::message::InstallSnapshotResponse;
use coracle::message::RequestVoteRequest;
use coracle::message::RequestVoteResponse;
use coracle::metrics::NodeMetrics;
use coracle::metrics::Wait;
use coracle::Config;
use coracle::LogIndex;
use coracle::Node;
use coracle::NodeId;
use coracle::Role;
use coracle::TokioClock;
use coracle::Transport;
use coracle::TransportError;
use memstore::MemStore;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A type which emulates a network transport and implements the `Transport` trait.
pub struct RaftRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (Node, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, seed: BTreeSet<NodeId>) {
        let store = Arc::new(MemStore::new(id));
        self.new_raft_node_with_store(id, seed, store).await;
    }

    /// Create and register a new node on top of an existing store.
    pub async fn new_raft_node_with_store(self: &Arc<Self>, id: NodeId, seed: BTreeSet<NodeId>, store: Arc<MemStore>) {
        let node = Node::new(
            id,
            self.config.clone(),
            seed,
            self.clone(),
            Arc::new(TokioClock),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, store));
    }

    /// Bring up a fresh cluster of nodes `0..n`, returning the elected leader.
    pub async fn new_cluster(self: &Arc<Self>, n: u64) -> Result<NodeId> {
        let members: BTreeSet<NodeId> = (0..n).collect();
        for id in 0..n {
            self.new_raft_node(id, members.clone()).await;
        }
        let leader = self.wait_for_leader(Duration::from_secs(10)).await?;
        // The first leader commits the seed configuration as entry 1.
        self.wait_for_log(&members, 1, Some(Duration::from_secs(10)), "initial configuration entry").await?;
        Ok(leader)
    }

    /// Remove the target node from the routing table & isolation, returning its handles.
    pub async fn remove_node(&self, id: NodeId) -> Option<(Node, Arc<MemStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        opt_handles
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<NodeMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|(node, _)| node.status()).collect()
    }

    /// Get a handle to the storage backend of the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.1.clone())
    }

    /// Get a handle to the target node.
    pub async fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.0.clone())
    }

    /// The ID of the current non-isolated leader, highest term winning.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics()
            .await
            .into_iter()
            .filter(|m| m.role == Role::Leader && !isolated.contains(&m.id))
            .max_by_key(|m| m.current_term)
            .map(|m| m.id)
    }

    /// Wait until some node has become leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout.or(Some(Duration::from_secs(5)))))
    }

    /// Wait for metrics on the target node until they satisfy some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<NodeMetrics>
    where
        T: Fn(&NodeMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        Ok(wait.metrics(func, msg).await?)
    }

    /// Wait for the specified nodes to have appended & applied up to `want`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want: LogIndex,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout).await?.log(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the specified nodes to assume the given role.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_role(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want: Role,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout).await?.role(want, msg).await?;
        }
        Ok(())
    }

    /// Submit a command to the target node.
    pub async fn submit(&self, target: NodeId, command: &[u8]) -> Result<Vec<u8>, ClientError> {
        let node = self.get_node(&target).await.map_err(|_| ClientError::ShuttingDown)?;
        node.submit_command(command.to_vec(), Duration::from_secs(10)).await
    }

    /// Submit `count` commands to the target node, failing the test on error.
    pub async fn submit_many(&self, target: NodeId, prefix: &str, count: usize) {
        for serial in 0..count {
            let command = format!("{}-{}", prefix, serial).into_bytes();
            if let Err(err) = self.submit(target, &command).await {
                panic!("error from submit_command {}-{}: {:?}", prefix, serial, err)
            }
        }
    }

    /// Perform a linearizable read against the target node.
    pub async fn read(&self, target: NodeId, request: &[u8]) -> Result<Vec<u8>, ClientError> {
        let node = self.get_node(&target).await.map_err(|_| ClientError::ShuttingDown)?;
        node.read_state(request.to_vec(), Duration::from_secs(5)).await
    }

    pub async fn add_server(&self, leader: NodeId, target: NodeId) -> Result<bool, ClientError> {
        let node = self.get_node(&leader).await.map_err(|_| ClientError::ShuttingDown)?;
        node.add_server(target, Duration::from_secs(10)).await
    }

    pub async fn remove_server(&self, leader: NodeId, target: NodeId) -> Result<bool, ClientError> {
        let node = self.get_node(&leader).await.map_err(|_| ClientError::ShuttingDown)?;
        node.remove_server(target, Duration::from_secs(10)).await
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the logs of the given nodes hold identical entries.
    pub async fn assert_logs_converged(&self, node_ids: &BTreeSet<NodeId>) {
        let mut baseline: Option<(NodeId, Vec<_>)> = None;
        for id in node_ids.iter() {
            let store = self.get_storage_handle(id).await.expect("storage handle");
            let log: Vec<_> = store.get_log().await.into_iter().collect();
            match &baseline {
                None => baseline = Some((*id, log)),
                Some((base_id, base_log)) => {
                    assert_eq!(
                        base_log, &log,
                        "log of node {} diverges from node {}",
                        id, base_id
                    );
                }
            }
        }
    }

    /// Assert that the cluster has exactly one non-isolated leader and that
    /// every non-isolated node agrees on it and on the applied log.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let live: Vec<_> = nodes.iter().filter(|m| !isolated.contains(&m.id)).collect();
        let leader = live
            .iter()
            .find(|m| m.role == Role::Leader)
            .expect("expected to find a cluster leader");
        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);

        for node in live.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
        }
    }
}

#[async_trait]
impl Transport for RaftRouter {
    async fn send_request_vote(
        &self,
        target: NodeId,
        rpc: RequestVoteRequest,
        timeout: Duration,
    ) -> Result<RequestVoteResponse, TransportError> {
        let node = self.route(target, rpc.candidate_id).await?;
        match tokio::time::timeout(timeout, node.vote(rpc)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_elapsed) => Err(TransportError::Timeout),
        }
    }

    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let node = self.route(target, rpc.leader_id).await?;
        match tokio::time::timeout(timeout, node.append_entries(rpc)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_elapsed) => Err(TransportError::Timeout),
        }
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let node = self.route(target, rpc.leader_id).await?;
        match tokio::time::timeout(timeout, node.install_snapshot(rpc)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_elapsed) => Err(TransportError::Timeout),
        }
    }
}

impl RaftRouter {
    /// Resolve the target node, honoring isolation of either endpoint.
    async fn route(&self, target: NodeId, source: NodeId) -> Result<Node, TransportError> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&source) {
            return Err(TransportError::Unreachable);
        }
        drop(isolated);
        let rt = self.routing_table.read().await;
        match rt.get(&target) {
            Some((node, _)) => Ok(node.clone()),
            None => Err(TransportError::Unreachable),
        }
    }
}
