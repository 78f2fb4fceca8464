//! Leader-directed write replication, follower write forwarding, and
//! follower startup resync.

use std::sync::Arc;

use tokio::time::{self, Duration};

use crate::cluster::rpc::{
    self, NodeRequest, NodeResponse, COMMAND_DEADLINE, SYNC_DEADLINE,
};
use crate::cluster::{ClusterState, NodeId};
use crate::handler::CommandHandler;
use crate::protocol::{Command, Request, WireResponse, STATUS_ERROR};
use crate::utils::GeomysError;

/// Resync attempts made at follower startup before giving up and starting
/// with an empty store.
const SYNC_ATTEMPTS: usize = 3;

/// Pause between failed resync attempts.
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Handlers for the replication-plane RPCs.
pub struct ReplicationService {
    cluster: Arc<ClusterState>,
    handler: Arc<CommandHandler>,
}

impl ReplicationService {
    pub fn new(
        cluster: Arc<ClusterState>,
        handler: Arc<CommandHandler>,
    ) -> Self {
        ReplicationService { cluster, handler }
    }

    /// Leader side of a forwarded client write: apply locally (which logs
    /// it), fan out to every follower, then relay the outcome. The
    /// originating follower applies the write only through the fan-out.
    pub(crate) async fn forward_request(
        &self,
        node_id: NodeId,
        command: Command,
    ) -> NodeResponse {
        let me = self.cluster.node_id();
        pf_debug!(me; "received forwarded {} from node {}", command.command, node_id);

        let req = match command.to_request() {
            Ok(req) => req,
            Err(e) => {
                return NodeResponse::Forward {
                    status: STATUS_ERROR.into(),
                    message: e.to_string(),
                    value: String::new(),
                }
            }
        };

        match self.handler.handle(&req).await {
            Ok(resp) => {
                replicate_to_followers(&self.cluster, &command).await;
                let wire = resp.to_wire();
                NodeResponse::Forward {
                    status: wire.status,
                    message: wire.message.unwrap_or_default(),
                    value: wire.value.unwrap_or_default(),
                }
            }
            Err(e) => NodeResponse::Forward {
                status: STATUS_ERROR.into(),
                message: e.to_string(),
                value: String::new(),
            },
        }
    }

    /// Follower side of the fan-out: apply the leader's write through the
    /// local handler. Replicated commands are never forwarded onward or
    /// re-replicated.
    pub(crate) async fn replicate_request(
        &self,
        command: Command,
    ) -> NodeResponse {
        let me = self.cluster.node_id();

        let result = match command.to_request() {
            Ok(req) => self.handler.handle(&req).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                pf_debug!(me; "applied replicated {}", command.command);
                NodeResponse::ReplicateAck { success: true }
            }
            Err(e) => {
                pf_warn!(
                    me;
                    "applying replicated {} failed: {}",
                    command.command, e
                );
                NodeResponse::ReplicateAck { success: false }
            }
        }
    }

    /// Serves a restarting follower the full logged history in on-disk
    /// order.
    pub(crate) async fn sync_request(&self) -> NodeResponse {
        let me = self.cluster.node_id();
        match self.handler.binlog().load_all().await {
            Ok(records) => {
                pf_info!(me; "serving resync of {} logged writes", records.len());
                NodeResponse::Sync {
                    commands: records.iter().map(Command::from_logged).collect(),
                }
            }
            Err(e) => NodeResponse::Error {
                message: e.to_string(),
            },
        }
    }
}

/// Fans an applied write out to every known peer, sequentially and
/// best-effort: per-peer failures are logged and do not fail the write.
pub async fn replicate_to_followers(
    cluster: &ClusterState,
    command: &Command,
) {
    let me = cluster.node_id();
    let mut peers: Vec<(NodeId, String)> = cluster.nodes().into_iter().collect();
    peers.sort();

    for (id, address) in peers {
        if id == me {
            continue;
        }
        let req = NodeRequest::Replicate {
            command: command.clone(),
        };
        match rpc::call(&address, &req, COMMAND_DEADLINE).await {
            Ok(NodeResponse::ReplicateAck { success: true }) => {
                pf_debug!(me; "replicated {} to node {}", command.command, id);
            }
            Ok(_) => {
                pf_warn!(
                    me;
                    "node {} did not accept replicated {}",
                    id, command.command
                );
            }
            Err(e) => {
                pf_warn!(
                    me;
                    "replicating {} to node {} failed: {}",
                    command.command, id, e
                );
            }
        }
    }
}

/// Follower side of a client write: hand it to the leader and relay the
/// leader's response shape verbatim.
pub async fn forward_to_leader(
    cluster: &ClusterState,
    req: &Request,
) -> Result<WireResponse, GeomysError> {
    let me = cluster.node_id();
    let leader_addr = cluster.leader_address();
    if leader_addr.is_empty() {
        return Err(GeomysError::Transient("no leader available".into()));
    }

    pf_debug!(me; "forwarding {} to leader at {}", req.command_name(), leader_addr);
    let rpc_req = NodeRequest::Forward {
        node_id: me,
        command: Command::from_request(req),
    };
    match rpc::call(&leader_addr, &rpc_req, COMMAND_DEADLINE).await? {
        NodeResponse::Forward {
            status,
            message,
            value,
        } => Ok(WireResponse {
            status,
            message: (!message.is_empty()).then_some(message),
            value: (!value.is_empty()).then_some(value),
        }),
        NodeResponse::Error { message } => {
            Err(GeomysError::Transient(message))
        }
        _ => Err(GeomysError::Transient(
            "unexpected response from leader".into(),
        )),
    }
}

/// Follower startup resync: fetch the leader's logged history and apply
/// it in order. The local log is cleared first; it is superseded by the
/// leader's image (local-only writes are deliberately discarded). Applied
/// commands are re-logged locally so this node can serve resyncs if it is
/// ever promoted.
pub async fn resync_from_leader(
    cluster: &ClusterState,
    handler: &CommandHandler,
) -> Result<usize, GeomysError> {
    let me = cluster.node_id();
    let leader_addr = cluster.leader_address();
    if leader_addr.is_empty() {
        return logged_err!(me; "no leader known to resync from");
    }

    for attempt in 1..=SYNC_ATTEMPTS {
        match rpc::call(&leader_addr, &NodeRequest::Sync, SYNC_DEADLINE).await
        {
            Ok(NodeResponse::Sync { commands }) => {
                handler.binlog().clear().await?;

                let mut applied = 0;
                for command in &commands {
                    let outcome = match command.to_request() {
                        Ok(req) => handler.handle(&req).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(()) => applied += 1,
                        Err(e) => pf_debug!(
                            me;
                            "resync skipped {} '{}': {}",
                            command.command, command.key, e
                        ),
                    }
                }
                pf_info!(
                    me;
                    "resynced {} of {} commands from leader",
                    applied, commands.len()
                );
                return Ok(applied);
            }
            Ok(other) => {
                pf_warn!(me; "unexpected resync response: {:?}", other);
            }
            Err(e) => {
                pf_warn!(
                    me;
                    "resync attempt {}/{} failed: {}",
                    attempt, SYNC_ATTEMPTS, e
                );
            }
        }
        if attempt < SYNC_ATTEMPTS {
            time::sleep(SYNC_RETRY_INTERVAL).await;
        }
    }

    logged_err!(me; "leader at {} unreachable for resync", leader_addr)
}
