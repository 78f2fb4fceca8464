//! Public interface to the Geomys core library, linked by both the server
//! executable and the client REPL executable.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

mod binlog;
mod cluster;
mod edge;
mod handler;
mod protocol;
mod store;

pub use binlog::{Binlog, LoggedRequest};
pub use cluster::election::{
    monitor_followers, monitor_leader, run_election, ElectionService,
};
pub use cluster::replication::{
    forward_to_leader, replicate_to_followers, resync_from_leader,
    ReplicationService,
};
pub use cluster::rpc::{NodeRequest, NodeResponse};
pub use cluster::{ClusterServer, ClusterState, NodeId, NO_LEADER};
pub use edge::EdgeServer;
pub use handler::CommandHandler;
pub use protocol::{
    Command, Request, Response, WireRequest, WireResponse, MAX_FRAME_BYTES,
};
pub use store::Store;
pub use utils::{Config, GeomysError};
