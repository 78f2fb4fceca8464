//! Node-to-node RPC plumbing: length-prefixed MessagePack frames over TCP,
//! a request/response enum pair as the contract, and per-call deadlines.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::{self, Duration};

use crate::cluster::NodeId;
use crate::protocol::Command;
use crate::utils::{
    recv_frame, send_frame, tcp_connect_with_retry, GeomysError,
};

/// Deadline for a RequestVote call.
pub(crate) const VOTE_DEADLINE: Duration = Duration::from_secs(20);

/// Deadline for a Heartbeat call.
pub(crate) const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(3);

/// Deadline for ForwardRequest and ReplicateRequest calls.
pub(crate) const COMMAND_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for a SyncRequest call.
pub(crate) const SYNC_DEADLINE: Duration = Duration::from_secs(10);

/// A request from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Election: ask the responder who the leader should be.
    RequestVote { node_id: NodeId, term: i32 },

    /// Election-plane keepalive; the responder derives the caller's
    /// address as `caller_ip:port`.
    Heartbeat { node_id: NodeId, port: u16 },

    /// A follower hands a client write to the leader.
    Forward { node_id: NodeId, command: Command },

    /// The leader delivers an applied write to a follower.
    Replicate { command: Command },

    /// A restarting follower asks for the leader's full logged history.
    Sync,
}

/// A response to a `NodeRequest`, variant-matched to the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    Vote {
        smallest_node: NodeId,
    },

    Heartbeat {
        success: bool,
        nodes: std::collections::HashMap<NodeId, String>,
    },

    /// Command outcome relayed back to the forwarding follower. Empty
    /// strings mark absent fields.
    Forward {
        status: String,
        message: String,
        value: String,
    },

    ReplicateAck {
        success: bool,
    },

    Sync {
        commands: Vec<Command>,
    },

    Error {
        message: String,
    },
}

/// Serving side of the node RPC plumbing: one implementor dispatches every
/// request variant.
#[async_trait]
pub(crate) trait NodeService: Send + Sync + 'static {
    async fn dispatch(
        &self,
        peer: SocketAddr,
        req: NodeRequest,
    ) -> NodeResponse;
}

/// Accept loop: one task per inbound connection, each looping over
/// request frames and answering with one response frame apiece.
pub(crate) async fn serve(
    me: NodeId,
    listener: TcpListener,
    service: Arc<dyn NodeService>,
) -> Result<(), GeomysError> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    serve_connection(me, stream, peer, service).await;
                });
            }
            Err(e) => {
                pf_warn!(me; "error accepting node connection: {}", e);
            }
        }
    }
}

async fn serve_connection(
    me: NodeId,
    mut stream: TcpStream,
    peer: SocketAddr,
    service: Arc<dyn NodeService>,
) {
    let mut read_buf = BytesMut::new();
    loop {
        let req: NodeRequest =
            match recv_frame(&mut read_buf, &mut stream).await {
                Ok(req) => req,
                Err(_) => {
                    // peers disconnect after each call round
                    pf_trace!(me; "node connection from {} closed", peer);
                    return;
                }
            };

        let resp = service.dispatch(peer, req).await;
        if let Err(e) = send_frame(&mut stream, &resp).await {
            pf_warn!(me; "error responding to {}: {}", peer, e);
            return;
        }
    }
}

/// Performs one RPC round trip on a fresh connection, bounded by
/// `deadline`. Expiry surfaces as a transient error.
pub(crate) async fn call(
    addr: &str,
    req: &NodeRequest,
    deadline: Duration,
) -> Result<NodeResponse, GeomysError> {
    time::timeout(deadline, async {
        let conn_addr = lookup_host(addr).await?.next().ok_or_else(|| {
            GeomysError::Transient(format!("cannot resolve '{}'", addr))
        })?;
        let mut stream = tcp_connect_with_retry(conn_addr, 0).await?;
        send_frame(&mut stream, req).await?;
        let mut read_buf = BytesMut::new();
        recv_frame(&mut read_buf, &mut stream).await
    })
    .await?
}

#[cfg(test)]
mod rpc_tests {
    use super::*;

    /// Echoes enough structure back to verify dispatch plumbing.
    struct MockService;

    #[async_trait]
    impl NodeService for MockService {
        async fn dispatch(
            &self,
            _peer: SocketAddr,
            req: NodeRequest,
        ) -> NodeResponse {
            match req {
                NodeRequest::RequestVote { node_id, .. } => {
                    NodeResponse::Vote {
                        smallest_node: node_id,
                    }
                }
                NodeRequest::Heartbeat { .. } => NodeResponse::Heartbeat {
                    success: true,
                    nodes: std::collections::HashMap::new(),
                },
                NodeRequest::Sync => {
                    // simulate a slow responder
                    time::sleep(Duration::from_millis(200)).await;
                    NodeResponse::Sync { commands: vec![] }
                }
                _ => NodeResponse::Error {
                    message: "unhandled".into(),
                },
            }
        }
    }

    async fn spawn_mock() -> Result<SocketAddr, GeomysError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = serve(0, listener, Arc::new(MockService)).await;
        });
        Ok(addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_round_trip() -> Result<(), GeomysError> {
        let addr = spawn_mock().await?;
        let resp = call(
            &addr.to_string(),
            &NodeRequest::RequestVote {
                node_id: 3,
                term: 1,
            },
            VOTE_DEADLINE,
        )
        .await?;
        assert_eq!(resp, NodeResponse::Vote { smallest_node: 3 });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consecutive_calls() -> Result<(), GeomysError> {
        let addr = spawn_mock().await?;
        for _ in 0..3 {
            let resp = call(
                &addr.to_string(),
                &NodeRequest::Heartbeat {
                    node_id: 2,
                    port: 7100,
                },
                HEARTBEAT_DEADLINE,
            )
            .await?;
            assert!(
                matches!(resp, NodeResponse::Heartbeat { success: true, .. })
            );
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_expiry_is_transient() -> Result<(), GeomysError> {
        let addr = spawn_mock().await?;
        let result = call(
            &addr.to_string(),
            &NodeRequest::Sync,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(GeomysError::Transient(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_connection_is_transient() {
        // port 1 is essentially never listening
        let result = call(
            "127.0.0.1:1",
            &NodeRequest::Sync,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(GeomysError::Transient(_))));
    }
}
