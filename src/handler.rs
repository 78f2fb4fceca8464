//! Command dispatch over the in-memory store, with write-log persistence
//! and startup recovery replay.

use std::sync::Arc;

use crate::binlog::{Binlog, LoggedRequest};
use crate::cluster::NodeId;
use crate::protocol::{Request, Response};
use crate::store::Store;
use crate::utils::GeomysError;

/// Single entry point for executing commands, shared by the edge, the
/// replication service, and recovery.
#[derive(Debug)]
pub struct CommandHandler {
    /// My node ID (log prefix).
    me: NodeId,

    store: Arc<Store>,
    binlog: Arc<Binlog>,
}

impl CommandHandler {
    /// Creates a new command handler over the given store and write log.
    pub fn new(me: NodeId, store: Arc<Store>, binlog: Arc<Binlog>) -> Self {
        CommandHandler { me, store, binlog }
    }

    /// Executes one command. A successful reply for a write implies a
    /// durable log record visible to subsequent loads and sync requests.
    pub async fn handle(
        &self,
        req: &Request,
    ) -> Result<Response, GeomysError> {
        self.handle_inner(req, true).await
    }

    async fn handle_inner(
        &self,
        req: &Request,
        logging: bool,
    ) -> Result<Response, GeomysError> {
        let response = match req {
            Request::Ping => Response::Message("PONG".into()),

            Request::Echo { message } => Response::Message(message.clone()),

            Request::Set {
                key,
                value,
                ttl_ms,
            } => {
                self.store.set(key, value, *ttl_ms)?;
                Response::Ok
            }

            Request::Get { key } => Response::Value(self.store.get(key)?),

            Request::Incr { key, delta } => {
                Response::Value(self.store.incr(key, *delta)?.to_string())
            }

            Request::Push { key, value } => {
                self.store.push(key, value)?;
                Response::Ok
            }

            Request::LPop { key } => Response::Value(self.store.lpop(key)?),

            Request::RPop { key } => Response::Value(self.store.rpop(key)?),

            Request::FlushDb => {
                // clear persisted data first so a crash in between cannot
                // resurrect discarded entries on recovery
                self.binlog.clear().await?;
                self.store.clear();
                Response::Ok
            }
        };

        if logging {
            if let Some(record) = req.to_logged() {
                self.binlog.append(&record).await?;
            }
        }

        pf_trace!(self.me; "handled {} -> {:?}", req.command_name(), response);
        Ok(response)
    }

    /// Applies a recovered record sequence with logging suppressed.
    /// Per-record failures are skipped, not propagated. Returns the number
    /// of records applied.
    pub async fn replay(&self, records: &[LoggedRequest]) -> usize {
        let mut applied = 0;
        for rec in records {
            match Request::from_logged(rec) {
                Ok(req) => match self.handle_inner(&req, false).await {
                    Ok(_) => applied += 1,
                    Err(e) => pf_debug!(
                        self.me;
                        "replay skipped {} '{}': {}",
                        rec.command, rec.key, e
                    ),
                },
                Err(e) => pf_warn!(
                    self.me;
                    "replay dropped unparsable record '{}': {}",
                    rec.command, e
                ),
            }
        }
        applied
    }

    /// Rebuilds the store from the local write log (standalone and
    /// bootstrap-leader startup; followers resync from the leader instead).
    pub async fn recover(&self) -> Result<usize, GeomysError> {
        let records = self.binlog.load_all().await?;
        let applied = self.replay(&records).await;
        pf_info!(
            self.me;
            "recovered {} of {} logged writes",
            applied, records.len()
        );
        Ok(applied)
    }

    /// The write log backing this handler.
    pub fn binlog(&self) -> &Arc<Binlog> {
        &self.binlog
    }
}
