//! Standalone topology router.
//!
//! Routes every command to one node over one shared [`Connection`]. If that
//! node turns out to be a replica (a write is answered with `READONLY`),
//! the router asks it for its master with `INFO REPLICATION`, switches to
//! the master and retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cmd;
use crate::config::{ClientConfig, NodeDescriptor};
use crate::connection::conn::{Connection, ConnectionOptions};
use crate::error::{Result, RsedisError};
use crate::resp::command::Command;
use crate::resp::types::Reply;
use crate::router::{parse_info, Redirect, Router};

/// Router for a single Redis server.
pub struct StandaloneRouter {
    current: RwLock<Arc<Connection>>,
    opts: ConnectionOptions,
    max_redirects: usize,
    /// False before the first `connect()` when auto-connect is off, and
    /// after `close()`.
    active: AtomicBool,
}

impl StandaloneRouter {
    pub fn new(
        node: NodeDescriptor,
        opts: ConnectionOptions,
        max_redirects: usize,
        auto_connect: bool,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(Connection::new(node, opts.clone()))),
            opts,
            max_redirects,
            active: AtomicBool::new(auto_connect),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let node = config
            .nodes
            .first()
            .cloned()
            .ok_or_else(|| RsedisError::Config("no node configured".into()))?;
        Ok(Self::new(
            node,
            ConnectionOptions::from_config(config),
            config.max_redirects,
            config.auto_connect,
        ))
    }

    /// The node commands currently go to.
    pub fn node(&self) -> NodeDescriptor {
        self.current.read().node().clone()
    }

    fn current(&self) -> Arc<Connection> {
        self.current.read().clone()
    }

    fn check_active(&self) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RsedisError::NotConnected(
                "client is closed or was never connected".into(),
            ))
        }
    }

    /// Retry `cmd` while `reply` says the node is a replica.
    async fn follow(
        &self,
        cmd: &Command,
        mut conn: Arc<Connection>,
        mut reply: Reply,
    ) -> Result<Reply> {
        let mut hops = 0;
        while let Some(Redirect::ReadOnly) = Redirect::from_reply(&reply) {
            if hops == self.max_redirects {
                return Err(RsedisError::RedirectExhausted {
                    redirects: hops,
                    last: reply.as_error_msg().unwrap_or_default().to_string(),
                });
            }
            hops += 1;
            if !self.failover(&conn).await? {
                return Ok(reply);
            }
            conn = self.current();
            reply = conn.execute(cmd).await?;
        }
        Ok(reply)
    }

    /// Point the router at the master of `stale`. Returns false when no
    /// master could be found.
    async fn failover(&self, stale: &Arc<Connection>) -> Result<bool> {
        if !Arc::ptr_eq(&self.current(), stale) {
            // Another caller already switched.
            return Ok(true);
        }

        let info = stale.execute(&cmd!("INFO", "REPLICATION")).await?;
        let Some(fields) = info.as_str().map(parse_info) else {
            return Ok(false);
        };
        let host = fields.get("master_host");
        let port = fields.get("master_port").and_then(|p| p.parse::<u16>().ok());
        let (Some(host), Some(port)) = (host, port) else {
            debug!(addr = %stale.addr(), "READONLY from a node with no master");
            return Ok(false);
        };

        let node = stale.node().relocated(host.as_str(), port);
        if node.addr() == stale.addr() {
            return Ok(false);
        }
        info!(from = %stale.addr(), to = %node.addr(), "node is a replica, switching to its master");

        let master = Arc::new(Connection::new(node, self.opts.clone()));
        let swapped = {
            let mut current = self.current.write();
            if Arc::ptr_eq(&current, stale) {
                *current = master;
                true
            } else {
                false
            }
        };
        if swapped {
            stale.close().await;
        }
        Ok(true)
    }
}

impl Router for StandaloneRouter {
    async fn submit(&self, cmd: &Command) -> Result<Reply> {
        self.check_active()?;
        let conn = self.current();
        let reply = conn.execute(cmd).await?;
        self.follow(cmd, conn, reply).await
    }

    async fn submit_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        self.check_active()?;
        let conn = self.current();
        let mut replies = conn.execute_batch(cmds).await?;
        // A replica rejects writes without running them, so only the
        // rejected commands are retried.
        for (cmd, reply) in cmds.iter().zip(replies.iter_mut()) {
            if let Some(Redirect::ReadOnly) = Redirect::from_reply(reply) {
                let first = std::mem::replace(reply, Reply::BulkString(None));
                *reply = self.follow(cmd, conn.clone(), first).await?;
            }
        }
        Ok(replies)
    }

    async fn connect(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        self.current().connect().await
    }

    async fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.current().close().await;
    }

    fn is_ready(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.current().is_connected()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
