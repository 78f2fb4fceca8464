//! Cluster membership state and the node-to-node service modules.

pub mod election;
pub mod replication;
pub mod rpc;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::handler::CommandHandler;
use crate::utils::{tcp_bind_with_retry, GeomysError};
use election::ElectionService;
use replication::ReplicationService;
use rpc::{NodeRequest, NodeResponse, NodeService};

/// Node ID type; stable per process across restarts.
pub type NodeId = i32;

/// Sentinel leader ID meaning "no leader known".
pub const NO_LEADER: NodeId = -1;

/// Shared cluster view. One mutex guards all of it; accessors copy data
/// out so the lock is never held across an `.await`.
#[derive(Debug)]
struct ClusterView {
    leader_id: NodeId,
    leader_address: String,

    /// Peer ID -> cluster-plane address. Never contains this node itself.
    nodes: HashMap<NodeId, String>,

    /// Peer ID -> last heartbeat heard from it (leader-side bookkeeping).
    heartbeats: HashMap<NodeId, Instant>,

    /// Monotonic election term; bumped on each round initiated locally,
    /// adopted from higher-termed vote requests.
    current_term: i32,

    /// When the last successful heartbeat round trip to the leader
    /// finished (follower-side bookkeeping).
    last_heartbeat_received: Instant,
}

/// Per-node cluster membership state with a narrow accessor surface. The
/// election and replication modules depend on this, not on each other.
#[derive(Debug)]
pub struct ClusterState {
    self_id: NodeId,
    self_port: u16,
    inner: Mutex<ClusterView>,
}

impl ClusterState {
    /// Creates the state for a node listening for cluster RPCs on
    /// `self_port`, with no leader and no known peers.
    pub fn new(self_id: NodeId, self_port: u16) -> Self {
        ClusterState {
            self_id,
            self_port,
            inner: Mutex::new(ClusterView {
                leader_id: NO_LEADER,
                leader_address: String::new(),
                nodes: HashMap::new(),
                heartbeats: HashMap::new(),
                current_term: 0,
                last_heartbeat_received: Instant::now(),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    /// The cluster-plane port this node listens on.
    pub fn self_port(&self) -> u16 {
        self.self_port
    }

    pub fn leader_id(&self) -> NodeId {
        self.inner.lock().unwrap().leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id() == self.self_id
    }

    pub fn leader_address(&self) -> String {
        self.inner.lock().unwrap().leader_address.clone()
    }

    pub fn set_leader(&self, id: NodeId, address: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.leader_id = id;
        inner.leader_address = address.into();
    }

    /// Points at a leader address before its ID is known (join startup).
    pub fn set_leader_address(&self, address: impl Into<String>) {
        self.inner.lock().unwrap().leader_address = address.into();
    }

    /// Snapshot of the peer table.
    pub fn nodes(&self) -> HashMap<NodeId, String> {
        self.inner.lock().unwrap().nodes.clone()
    }

    /// Replaces the peer table with a membership snapshot received from
    /// the leader. This node itself is never listed.
    pub fn set_nodes(&self, mut nodes: HashMap<NodeId, String>) {
        nodes.remove(&self.self_id);
        self.inner.lock().unwrap().nodes = nodes;
    }

    /// Inserts or updates one peer. Returns true if it was previously
    /// unknown.
    pub fn add_node(&self, id: NodeId, address: impl Into<String>) -> bool {
        if id == self.self_id {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(id, address.into()).is_none()
    }

    pub fn remove_node(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&id);
        inner.heartbeats.remove(&id);
    }

    /// Stamps `now` as the last heartbeat heard from `id`.
    pub fn record_heartbeat(&self, id: NodeId) {
        self.inner
            .lock()
            .unwrap()
            .heartbeats
            .insert(id, Instant::now());
    }

    /// Drops every peer whose last heartbeat is older than `max_age`.
    /// Returns the dropped `(id, address)` pairs.
    pub fn prune_stale(&self, max_age: Duration) -> Vec<(NodeId, String)> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<NodeId> = inner
            .heartbeats
            .iter()
            .filter(|(_, &at)| now.duration_since(at) > max_age)
            .map(|(&id, _)| id)
            .collect();

        let mut dropped = Vec::new();
        for id in stale {
            inner.heartbeats.remove(&id);
            let address = inner.nodes.remove(&id).unwrap_or_default();
            dropped.push((id, address));
        }
        dropped
    }

    /// Stamps a successful heartbeat round trip to the leader.
    pub fn mark_heartbeat_received(&self) {
        self.inner.lock().unwrap().last_heartbeat_received = Instant::now();
    }

    /// How long since the last successful heartbeat to the leader.
    pub fn heartbeat_silence(&self) -> Duration {
        self.inner.lock().unwrap().last_heartbeat_received.elapsed()
    }

    /// Increments and returns the election term.
    pub fn bump_term(&self) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        inner.current_term += 1;
        inner.current_term
    }

    pub fn current_term(&self) -> i32 {
        self.inner.lock().unwrap().current_term
    }

    /// Adopts a higher term observed from a peer.
    pub fn observe_term(&self, term: i32) {
        let mut inner = self.inner.lock().unwrap();
        if term > inner.current_term {
            inner.current_term = term;
        }
    }

    /// The smallest ID among known peers and this node itself.
    pub fn smallest_known_node(&self) -> NodeId {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .keys()
            .copied()
            .chain(std::iter::once(self.self_id))
            .min()
            .unwrap()
    }
}

/// The node-to-node RPC server: one listener serving both the election and
/// the replication service.
pub struct ClusterServer {
    cluster: Arc<ClusterState>,
    election: ElectionService,
    replication: ReplicationService,
}

impl ClusterServer {
    pub fn new(
        cluster: Arc<ClusterState>,
        handler: Arc<CommandHandler>,
    ) -> Self {
        ClusterServer {
            election: ElectionService::new(cluster.clone()),
            replication: ReplicationService::new(cluster.clone(), handler),
            cluster,
        }
    }

    /// Binds the cluster port and serves requests until the process exits.
    pub async fn serve(
        self: Arc<Self>,
        bind_addr: SocketAddr,
    ) -> Result<(), GeomysError> {
        let me = self.cluster.node_id();
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!(me; "cluster RPC server listening on {}", bind_addr);
        rpc::serve(me, listener, self).await
    }
}

#[async_trait]
impl NodeService for ClusterServer {
    async fn dispatch(
        &self,
        peer: SocketAddr,
        req: NodeRequest,
    ) -> NodeResponse {
        match req {
            NodeRequest::RequestVote { node_id, term } => {
                self.election.request_vote(node_id, term).await
            }
            NodeRequest::Heartbeat { node_id, port } => {
                self.election.heartbeat(peer.ip(), node_id, port).await
            }
            NodeRequest::Forward { node_id, command } => {
                self.replication.forward_request(node_id, command).await
            }
            NodeRequest::Replicate { command } => {
                self.replication.replicate_request(command).await
            }
            NodeRequest::Sync => self.replication.sync_request().await,
        }
    }
}
