//! Leader election (bully by smallest ID) and heartbeat exchange.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::{self, Duration};

use crate::cluster::rpc::{
    self, NodeRequest, NodeResponse, HEARTBEAT_DEADLINE, VOTE_DEADLINE,
};
use crate::cluster::{ClusterState, NodeId, NO_LEADER};

/// Follower heartbeat period and leader housekeeping period.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Silence beyond this starts an election (follower side) or evicts a
/// peer (leader side).
pub(crate) const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between failed election rounds.
pub(crate) const ELECTION_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Pause after winning an election before taking up leader housekeeping.
pub(crate) const LEADER_SETTLE_INTERVAL: Duration = Duration::from_secs(5);

/// Handlers for the election-plane RPCs.
pub struct ElectionService {
    cluster: Arc<ClusterState>,
}

impl ElectionService {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        ElectionService { cluster }
    }

    /// Answers a vote request. Stale terms are rejected; otherwise the
    /// answer is the current leader if it still responds to a probe, else
    /// the smallest known node ID.
    pub(crate) async fn request_vote(
        &self,
        node_id: NodeId,
        term: i32,
    ) -> NodeResponse {
        let me = self.cluster.node_id();
        pf_info!(me; "received vote request from node {} (term {})", node_id, term);

        if term < self.cluster.current_term() {
            pf_warn!(
                me;
                "rejecting stale vote request: term {} < {}",
                term, self.cluster.current_term()
            );
            return NodeResponse::Vote {
                smallest_node: NO_LEADER,
            };
        }
        self.cluster.observe_term(term);

        // a vote changes nothing while the current leader still answers
        let leader_id = self.cluster.leader_id();
        let leader_addr = self.cluster.leader_address();
        if leader_id != NO_LEADER && !leader_addr.is_empty() {
            let probe = NodeRequest::Heartbeat {
                node_id: me,
                port: self.cluster.self_port(),
            };
            if let Ok(NodeResponse::Heartbeat { success: true, .. }) =
                rpc::call(&leader_addr, &probe, HEARTBEAT_DEADLINE).await
            {
                pf_info!(me; "current leader {} is alive, voting for it", leader_id);
                return NodeResponse::Vote {
                    smallest_node: leader_id,
                };
            }
        }

        let smallest = self.cluster.smallest_known_node();
        pf_info!(me; "no active leader found, voting for smallest node {}", smallest);
        NodeResponse::Vote {
            smallest_node: smallest,
        }
    }

    /// Registers a heartbeat from `node_id`, deriving its address from the
    /// connection's peer IP and the advertised port, and answers with the
    /// full membership snapshot.
    pub(crate) async fn heartbeat(
        &self,
        peer_ip: IpAddr,
        node_id: NodeId,
        port: u16,
    ) -> NodeResponse {
        let me = self.cluster.node_id();
        let address = format!("{}:{}", peer_ip, port);

        let is_new = self.cluster.add_node(node_id, address.clone());
        self.cluster.record_heartbeat(node_id);
        if is_new {
            pf_info!(me; "new node joined: node {} at {}", node_id, address);
        }

        NodeResponse::Heartbeat {
            success: true,
            nodes: self.cluster.nodes(),
        }
    }
}

/// One heartbeat round trip to the believed leader. On success the
/// returned membership snapshot replaces the local view (joins and leaves
/// are logged) and the silence clock resets.
async fn send_heartbeat(cluster: &ClusterState) -> bool {
    let me = cluster.node_id();
    let leader_addr = cluster.leader_address();
    if leader_addr.is_empty() {
        return false;
    }

    let req = NodeRequest::Heartbeat {
        node_id: me,
        port: cluster.self_port(),
    };
    match rpc::call(&leader_addr, &req, HEARTBEAT_DEADLINE).await {
        Ok(NodeResponse::Heartbeat { success, nodes }) => {
            let known = cluster.nodes();
            for (&id, address) in &nodes {
                if id != me && !known.contains_key(&id) {
                    pf_info!(me; "new node detected: node {} at {}", id, address);
                }
            }
            for &id in known.keys() {
                if !nodes.contains_key(&id) {
                    pf_warn!(me; "node {} has left the cluster", id);
                }
            }
            cluster.set_nodes(nodes);
            cluster.mark_heartbeat_received();
            success
        }
        Ok(_) => false,
        Err(e) => {
            pf_warn!(me; "heartbeat to leader failed: {}", e);
            false
        }
    }
}

/// Follower loop: heartbeat the leader every 5 s; after 15 s of silence,
/// run an election. Returns once this node has won one, so the caller can
/// switch to leader housekeeping.
pub async fn monitor_leader(cluster: Arc<ClusterState>) {
    let me = cluster.node_id();
    loop {
        if !send_heartbeat(&cluster).await
            && cluster.heartbeat_silence() > LIVENESS_TIMEOUT
        {
            pf_warn!(me; "leader appears to be down, initiating election");
            run_election(&cluster).await;
            if cluster.is_leader() {
                return;
            }
        }
        time::sleep(HEARTBEAT_INTERVAL).await;
    }
}

/// Leader housekeeping loop: every 5 s, evict peers silent for over 15 s.
pub async fn monitor_followers(cluster: Arc<ClusterState>) {
    let me = cluster.node_id();
    loop {
        time::sleep(HEARTBEAT_INTERVAL).await;
        for (id, address) in cluster.prune_stale(LIVENESS_TIMEOUT) {
            pf_info!(
                me;
                "node {} at {} seems to be down, removing from cluster",
                id, address
            );
        }
    }
}

/// Runs election rounds until one commits a leader. Each round asks every
/// peer for its vote; an empty or split answer set, or an unresponsive
/// winner, retries after 3 s.
pub async fn run_election(cluster: &Arc<ClusterState>) {
    let me = cluster.node_id();

    loop {
        let term = cluster.bump_term();
        pf_info!(me; "starting election round (term {})", term);

        let mut answers = BTreeSet::new();
        for (id, address) in cluster.nodes() {
            if id == me {
                continue;
            }
            let req = NodeRequest::RequestVote { node_id: me, term };
            match rpc::call(&address, &req, VOTE_DEADLINE).await {
                Ok(NodeResponse::Vote { smallest_node })
                    if smallest_node != NO_LEADER =>
                {
                    answers.insert(smallest_node);
                }
                Ok(_) => {
                    pf_warn!(me; "vote request to node {} was rejected", id);
                }
                Err(e) => {
                    pf_warn!(me; "vote request to node {} failed: {}", id, e);
                }
            }
        }

        if answers.is_empty() {
            pf_warn!(me; "no votes received, retrying election");
            time::sleep(ELECTION_RETRY_INTERVAL).await;
            continue;
        }
        if answers.len() > 1 {
            pf_warn!(me; "nodes did not agree on a leader, retrying election");
            time::sleep(ELECTION_RETRY_INTERVAL).await;
            continue;
        }

        let winner = *answers.iter().next().unwrap();
        let winner_addr = if winner == me {
            format!("127.0.0.1:{}", cluster.self_port())
        } else {
            match cluster.nodes().get(&winner) {
                Some(address) => address.clone(),
                None => {
                    pf_warn!(me; "winner {} has no known address, retrying", winner);
                    time::sleep(ELECTION_RETRY_INTERVAL).await;
                    continue;
                }
            }
        };

        // confirm the winner is actually alive before committing
        if winner != me {
            let probe = NodeRequest::Heartbeat {
                node_id: me,
                port: cluster.self_port(),
            };
            if !matches!(
                rpc::call(&winner_addr, &probe, HEARTBEAT_DEADLINE).await,
                Ok(NodeResponse::Heartbeat { success: true, .. })
            ) {
                pf_warn!(
                    me;
                    "elected node {} is not responding, retrying election",
                    winner
                );
                cluster.remove_node(winner);
                time::sleep(ELECTION_RETRY_INTERVAL).await;
                continue;
            }
        }

        cluster.set_leader(winner, winner_addr);
        pf_info!(me; "node {} is elected as the new leader", winner);
        if winner == me {
            pf_info!(me; "taking over as leader");
            time::sleep(LEADER_SETTLE_INTERVAL).await;
        }
        return;
    }
}
