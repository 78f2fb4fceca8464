//! Geomys server node executable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use tokio::runtime::Builder;

use geomys::{
    monitor_followers, monitor_leader, pf_error, pf_info, pf_warn,
    resync_from_leader, Binlog, ClusterServer, ClusterState, CommandHandler,
    Config, EdgeServer, GeomysError, NodeId, Store,
};

/// Sweep interval for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Offset from the client port to the cluster RPC port.
const CLUSTER_PORT_OFFSET: u16 = 1000;

/// How this node participates in a cluster, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Standalone,
    Bootstrap,
    Join(String),
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Node ID of myself (stable across restarts).
    #[arg(short, long, alias = "node_id")]
    node_id: Option<NodeId>,

    /// Client API port; the cluster RPC port is this + 1000.
    #[arg(short, long)]
    port: Option<u16>,

    /// Start as the initial leader of a new cluster.
    #[arg(long, conflicts_with = "join")]
    bootstrap: bool,

    /// Join an existing cluster through the given `host:port` cluster
    /// address.
    #[arg(long)]
    join: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitizes arguments against the loaded config, returning the
    /// effective `(node_id, client_port, mode)` triple.
    fn sanitize(
        &self,
        config: &Config,
    ) -> Result<(NodeId, u16, Mode), GeomysError> {
        let node_id = self.node_id.unwrap_or(config.node_id);
        if node_id < 0 {
            return Err(GeomysError::InvalidArgument(format!(
                "invalid node_id {}",
                node_id
            )));
        }

        let port = self.port.unwrap_or(config.internal_port);
        if port <= 1024 {
            return Err(GeomysError::InvalidArgument(format!(
                "invalid port {}",
                port
            )));
        }
        if port > u16::MAX - CLUSTER_PORT_OFFSET {
            return Err(GeomysError::InvalidArgument(format!(
                "port {} leaves no room for the cluster port",
                port
            )));
        }

        if self.threads < 2 {
            return Err(GeomysError::InvalidArgument(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let mode = if self.bootstrap {
            Mode::Bootstrap
        } else if let Some(seed) = &self.join {
            if !seed.contains(':') {
                return Err(GeomysError::InvalidArgument(format!(
                    "join address '{}' is not host:port",
                    seed
                )));
            }
            Mode::Join(seed.clone())
        } else if config.cluster_mode && config.is_leader {
            Mode::Bootstrap
        } else {
            Mode::Standalone
        };

        Ok((node_id, port, mode))
    }
}

/// Brings the node up in the given mode and serves until process exit.
async fn run(
    node_id: NodeId,
    port: u16,
    mode: Mode,
) -> Result<(), GeomysError> {
    let store = Arc::new(Store::new());
    store.start_sweeper(SWEEP_INTERVAL);

    let binlog = Binlog::shared().await?;
    let handler = Arc::new(CommandHandler::new(node_id, store, binlog));

    let client_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let cluster_port = port + CLUSTER_PORT_OFFSET;
    let cluster_addr: SocketAddr =
        format!("0.0.0.0:{}", cluster_port).parse()?;

    match mode {
        Mode::Standalone => {
            handler.recover().await?;
            let edge = Arc::new(EdgeServer::new(node_id, handler, None));
            edge.serve(client_addr).await
        }

        Mode::Bootstrap => {
            handler.recover().await?;

            let cluster = Arc::new(ClusterState::new(node_id, cluster_port));
            cluster
                .set_leader(node_id, format!("127.0.0.1:{}", cluster_port));
            spawn_cluster_server(
                node_id,
                cluster.clone(),
                handler.clone(),
                cluster_addr,
            );
            pf_info!(node_id; "bootstrapped as initial cluster leader");

            tokio::spawn(monitor_followers(cluster.clone()));

            let edge = Arc::new(EdgeServer::new(
                node_id,
                handler,
                Some(cluster),
            ));
            edge.serve(client_addr).await
        }

        Mode::Join(seed) => {
            let cluster = Arc::new(ClusterState::new(node_id, cluster_port));
            cluster.set_leader_address(seed.clone());
            spawn_cluster_server(
                node_id,
                cluster.clone(),
                handler.clone(),
                cluster_addr,
            );
            pf_info!(node_id; "joining cluster through {}", seed);

            // followers rebuild from the leader's image, not from the
            // local log
            if let Err(e) = resync_from_leader(&cluster, &handler).await {
                pf_warn!(node_id; "resync failed, starting empty: {}", e);
            }

            // follower duties until an election makes this node leader,
            // then leader housekeeping
            let duty_cluster = cluster.clone();
            tokio::spawn(async move {
                monitor_leader(duty_cluster.clone()).await;
                monitor_followers(duty_cluster).await;
            });

            let edge = Arc::new(EdgeServer::new(
                node_id,
                handler,
                Some(cluster),
            ));
            edge.serve(client_addr).await
        }
    }
}

fn spawn_cluster_server(
    node_id: NodeId,
    cluster: Arc<ClusterState>,
    handler: Arc<CommandHandler>,
    cluster_addr: SocketAddr,
) {
    let server = Arc::new(ClusterServer::new(cluster, handler));
    tokio::spawn(async move {
        if let Err(e) = server.serve(cluster_addr).await {
            pf_error!(node_id; "cluster RPC server exitted: {}", e);
        }
    });
}

// Server node executable main entrance.
fn server_main() -> Result<(), GeomysError> {
    let args = CliArgs::parse();
    let config = Config::load_or_default()?;
    let (node_id, port, mode) = args.sanitize(&config)?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-node{}", node_id))
        .build()?;

    runtime.block_on(run(node_id, port, mode))
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exitted: {}", e);
        std::process::exit(1);
    }
}
