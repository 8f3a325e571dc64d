//! Connections keyed by node address.
//!
//! Routers look up the connection for a node on every command, so the map
//! sits behind a `parking_lot::RwLock` (sync, held very briefly) and hands
//! out `Arc<Connection>` clones. Each node gets exactly one connection;
//! concurrency on it comes from pipelining, not from extra sockets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::NodeDescriptor;
use crate::connection::conn::{Connection, ConnectionOptions};

/// One shared [`Connection`] per node address.
pub struct NodePool {
    conns: RwLock<HashMap<String, Arc<Connection>>>,
    opts: ConnectionOptions,
}

impl NodePool {
    pub fn new(opts: ConnectionOptions) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            opts,
        }
    }

    /// The connection for `node`, created (unopened) on first request.
    pub fn get_or_create(&self, node: &NodeDescriptor) -> Arc<Connection> {
        let addr = node.addr();
        if let Some(conn) = self.conns.read().get(&addr) {
            return conn.clone();
        }
        let mut conns = self.conns.write();
        conns
            .entry(addr)
            .or_insert_with_key(|addr| {
                debug!(addr = %addr, "new node connection");
                Arc::new(Connection::new(node.clone(), self.opts.clone()))
            })
            .clone()
    }

    /// The existing connection for `addr`, if any.
    pub fn get(&self, addr: &str) -> Option<Arc<Connection>> {
        self.conns.read().get(addr).cloned()
    }

    pub fn addrs(&self) -> Vec<String> {
        self.conns.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Drop connections whose address fails `keep`; returns the removed ones
    /// so the caller can close them outside the lock.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<Arc<Connection>> {
        let mut conns = self.conns.write();
        let gone: Vec<String> = conns.keys().filter(|a| !keep(a.as_str())).cloned().collect();
        gone.iter().filter_map(|a| conns.remove(a)).collect()
    }

    /// Close and forget every connection. Later lookups start fresh.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<Connection>> = self.conns.write().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
