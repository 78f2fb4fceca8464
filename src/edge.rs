//! Client-facing TCP edge: accepts connections, decodes request maps,
//! routes them to the local handler or forwards them to the leader, and
//! encodes responses.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cluster::replication::{forward_to_leader, replicate_to_followers};
use crate::cluster::{ClusterState, NodeId};
use crate::handler::CommandHandler;
use crate::protocol::{
    Command, Request, WireRequest, WireResponse, MAX_FRAME_BYTES,
};
use crate::utils::{tcp_bind_with_retry, GeomysError};

/// The client API server. In cluster mode it carries the cluster state so
/// it can classify writes and route around non-leaders.
pub struct EdgeServer {
    /// My node ID (log prefix).
    me: NodeId,

    handler: Arc<CommandHandler>,
    cluster: Option<Arc<ClusterState>>,
}

impl EdgeServer {
    pub fn new(
        me: NodeId,
        handler: Arc<CommandHandler>,
        cluster: Option<Arc<ClusterState>>,
    ) -> Self {
        EdgeServer {
            me,
            handler,
            cluster,
        }
    }

    /// Binds the client port and serves connections until the process
    /// exits.
    pub async fn serve(
        self: Arc<Self>,
        bind_addr: SocketAddr,
    ) -> Result<(), GeomysError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!(self.me; "client API listening on {}", bind_addr);
        self.serve_with(listener).await
    }

    async fn serve_with(
        self: Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), GeomysError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let edge = self.clone();
                    tokio::spawn(async move {
                        edge.serve_client(stream, peer).await;
                    });
                }
                Err(e) => {
                    pf_warn!(self.me; "error accepting client connection: {}", e);
                }
            }
        }
    }

    /// Per-connection servant: one request map in, one response map out,
    /// until the client hangs up.
    async fn serve_client(&self, mut stream: TcpStream, peer: SocketAddr) {
        pf_debug!(self.me; "client {} connected", peer);
        let mut frame = [0u8; MAX_FRAME_BYTES];

        loop {
            let n = match stream.read(&mut frame).await {
                Ok(0) => {
                    pf_debug!(self.me; "client {} disconnected", peer);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    pf_warn!(self.me; "error reading from client {}: {}", peer, e);
                    return;
                }
            };

            let resp = self.process(&frame[..n]).await;
            let resp_bytes = match rmp_serde::encode::to_vec_named(&resp) {
                Ok(bytes) => bytes,
                Err(e) => {
                    pf_error!(self.me; "error encoding response: {}", e);
                    return;
                }
            };
            if let Err(e) = stream.write_all(&resp_bytes[..]).await {
                pf_warn!(self.me; "error replying to client {}: {}", peer, e);
                return;
            }
        }
    }

    /// Decodes, classifies, and executes one request frame.
    async fn process(&self, frame: &[u8]) -> WireResponse {
        let wire: WireRequest = match rmp_serde::decode::from_slice(frame) {
            Ok(wire) => wire,
            Err(_) => return WireResponse::error("malformed request"),
        };
        let req = match Request::from_wire(&wire) {
            Ok(req) => req,
            Err(e) => return WireResponse::error(e.message()),
        };
        pf_trace!(self.me; "client request {}", req.command_name());

        // a write landing on a follower belongs to the leader
        if let Some(cluster) = &self.cluster {
            if req.is_write() && !cluster.is_leader() {
                return match forward_to_leader(cluster, &req).await {
                    Ok(resp) => resp,
                    Err(e) => WireResponse::error(e.message()),
                };
            }
        }

        match self.handler.handle(&req).await {
            Ok(resp) => {
                if let Some(cluster) = &self.cluster {
                    if req.is_write() && cluster.is_leader() {
                        let command = Command::from_request(&req);
                        replicate_to_followers(cluster, &command).await;
                    }
                }
                resp.to_wire()
            }
            Err(e) => WireResponse::error(e.message()),
        }
    }
}

#[cfg(test)]
mod edge_tests {
    use super::*;
    use crate::binlog::Binlog;
    use crate::cluster::ClusterServer;
    use crate::store::Store;
    use std::path::Path;
    use tokio::fs;
    use tokio::time::{self, Duration};

    async fn spawn_edge(
        id: NodeId,
        log_path: &str,
        cluster: Option<Arc<ClusterState>>,
    ) -> Result<(SocketAddr, Arc<Store>, Arc<CommandHandler>), GeomysError>
    {
        let path = Path::new(log_path);
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }

        let store = Arc::new(Store::new());
        store.start_sweeper(Duration::from_millis(100));
        let binlog = Arc::new(Binlog::new(path).await?);
        let handler =
            Arc::new(CommandHandler::new(id, store.clone(), binlog));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let edge =
            Arc::new(EdgeServer::new(id, handler.clone(), cluster));
        tokio::spawn(async move {
            let _ = edge.serve_with(listener).await;
        });

        Ok((addr, store, handler))
    }

    async fn send_command(
        stream: &mut TcpStream,
        wire: &WireRequest,
    ) -> Result<WireResponse, GeomysError> {
        let bytes = rmp_serde::encode::to_vec_named(wire)?;
        stream.write_all(&bytes[..]).await?;

        let mut frame = [0u8; MAX_FRAME_BYTES];
        let n = stream.read(&mut frame).await?;
        Ok(rmp_serde::decode::from_slice(&frame[..n])?)
    }

    fn set_request(key: &str, value: &str) -> WireRequest {
        WireRequest {
            command: "SET".into(),
            key: Some(key.into()),
            value: Some(value.into()),
            ..WireRequest::default()
        }
    }

    fn get_request(key: &str) -> WireRequest {
        WireRequest {
            command: "GET".into(),
            key: Some(key.into()),
            ..WireRequest::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_get_missing() -> Result<(), GeomysError> {
        let (addr, _, _) =
            spawn_edge(0, "/tmp/test-geomys-edge-0.dat", None).await?;
        let mut conn = TcpStream::connect(addr).await?;

        let resp = send_command(&mut conn, &set_request("foo", "bar")).await?;
        assert_eq!(resp.status, "OK");

        let resp = send_command(&mut conn, &get_request("foo")).await?;
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.value.as_deref(), Some("bar"));

        let resp = send_command(&mut conn, &get_request("missing")).await?;
        assert_eq!(resp.status, "ERROR");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_echo_incr() -> Result<(), GeomysError> {
        let (addr, _, _) =
            spawn_edge(0, "/tmp/test-geomys-edge-1.dat", None).await?;
        let mut conn = TcpStream::connect(addr).await?;

        let resp = send_command(
            &mut conn,
            &WireRequest {
                command: "PING".into(),
                ..WireRequest::default()
            },
        )
        .await?;
        assert_eq!(resp.message.as_deref(), Some("PONG"));

        let resp = send_command(
            &mut conn,
            &WireRequest {
                command: "ECHO".into(),
                message: Some("Hello".into()),
                ..WireRequest::default()
            },
        )
        .await?;
        assert_eq!(resp.message.as_deref(), Some("Hello"));

        send_command(&mut conn, &set_request("counter", "10")).await?;
        let resp = send_command(
            &mut conn,
            &WireRequest {
                command: "INCR".into(),
                key: Some("counter".into()),
                offset: Some("5".into()),
                ..WireRequest::default()
            },
        )
        .await?;
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.value.as_deref(), Some("15"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_pops_in_order() -> Result<(), GeomysError> {
        let (addr, _, _) =
            spawn_edge(0, "/tmp/test-geomys-edge-2.dat", None).await?;
        let mut conn = TcpStream::connect(addr).await?;

        for item in ["item1", "item2"] {
            let resp = send_command(
                &mut conn,
                &WireRequest {
                    command: "PUSH".into(),
                    key: Some("L".into()),
                    value: Some(item.into()),
                    ..WireRequest::default()
                },
            )
            .await?;
            assert_eq!(resp.status, "OK");
        }

        let lpop = WireRequest {
            command: "LPOP".into(),
            key: Some("L".into()),
            ..WireRequest::default()
        };
        assert_eq!(
            send_command(&mut conn, &lpop).await?.value.as_deref(),
            Some("item1")
        );
        assert_eq!(
            send_command(&mut conn, &lpop).await?.value.as_deref(),
            Some("item2")
        );
        assert_eq!(send_command(&mut conn, &lpop).await?.status, "ERROR");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ttl_expires_between_reads() -> Result<(), GeomysError> {
        let (addr, _, _) =
            spawn_edge(0, "/tmp/test-geomys-edge-3.dat", None).await?;
        let mut conn = TcpStream::connect(addr).await?;

        let mut set = set_request("tempkey", "tempvalue");
        set.exp = Some(500);
        assert_eq!(send_command(&mut conn, &set).await?.status, "OK");

        time::sleep(Duration::from_millis(300)).await;
        let resp = send_command(&mut conn, &get_request("tempkey")).await?;
        assert_eq!(resp.value.as_deref(), Some("tempvalue"));

        time::sleep(Duration::from_millis(300)).await;
        let resp = send_command(&mut conn, &get_request("tempkey")).await?;
        assert_eq!(resp.status, "ERROR");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_frame_is_error() -> Result<(), GeomysError> {
        let (addr, _, _) =
            spawn_edge(0, "/tmp/test-geomys-edge-4.dat", None).await?;
        let mut conn = TcpStream::connect(addr).await?;

        conn.write_all(b"\x01\x02\x03not msgpack").await?;
        let mut frame = [0u8; MAX_FRAME_BYTES];
        let n = conn.read(&mut frame).await?;
        let resp: WireResponse = rmp_serde::decode::from_slice(&frame[..n])?;
        assert_eq!(resp.status, "ERROR");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_forwards_writes() -> Result<(), GeomysError> {
        // leader node: cluster RPC server + edge
        let leader_rpc = TcpListener::bind("127.0.0.1:0").await?;
        let leader_rpc_addr = leader_rpc.local_addr()?;

        let leader_path = Path::new("/tmp/test-geomys-edge-5-leader.dat");
        if fs::try_exists(leader_path).await? {
            fs::remove_file(leader_path).await?;
        }
        let leader_store = Arc::new(Store::new());
        let leader_binlog = Arc::new(Binlog::new(leader_path).await?);
        let leader_handler = Arc::new(CommandHandler::new(
            1,
            leader_store.clone(),
            leader_binlog,
        ));
        let leader_cluster =
            Arc::new(ClusterState::new(1, leader_rpc_addr.port()));
        leader_cluster.set_leader(1, leader_rpc_addr.to_string());
        let leader_server = Arc::new(ClusterServer::new(
            leader_cluster.clone(),
            leader_handler.clone(),
        ));
        tokio::spawn(async move {
            let _ = crate::cluster::rpc::serve(1, leader_rpc, leader_server)
                .await;
        });

        // follower edge pointing at the leader
        let follower_cluster = Arc::new(ClusterState::new(3, 9999));
        follower_cluster.set_leader(1, leader_rpc_addr.to_string());
        let (follower_addr, follower_store, _) = spawn_edge(
            3,
            "/tmp/test-geomys-edge-5-follower.dat",
            Some(follower_cluster),
        )
        .await?;

        // write through the follower's client port
        let mut conn = TcpStream::connect(follower_addr).await?;
        let resp = send_command(&mut conn, &set_request("k", "v")).await?;
        assert_eq!(resp.status, "OK");

        // the leader applied it; the follower did not apply it directly
        // (it would arrive via the fan-out, which has no route to this
        // follower's RPC port in this setup)
        assert_eq!(leader_store.get("k")?, "v");
        assert!(follower_store.get("k").is_err());

        // reads on the follower stay local
        let resp = send_command(&mut conn, &get_request("k")).await?;
        assert_eq!(resp.status, "ERROR");
        Ok(())
    }
}
