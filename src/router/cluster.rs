//! Redis Cluster topology router.
//!
//! Routes commands to the master owning the hash slot of their key.
//! Handles MOVED, ASK and READONLY redirections with a bounded number of
//! hops, rediscovers the slot map on demand, and can refresh it
//! periodically in the background.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cmd;
use crate::config::{ClientConfig, NodeDescriptor};
use crate::connection::conn::{Connection, ConnectionOptions};
use crate::connection::pool::NodePool;
use crate::crc16::key_slot;
use crate::error::{Result, RsedisError};
use crate::resp::command::Command;
use crate::resp::types::Reply;
use crate::router::topology::{ClusterTopology, SlotMap};
use crate::router::{split_addr, Redirect, Router};

/// Router for Redis Cluster topology.
///
/// Keeps one connection per node and a slot map for routing. The slot map
/// is discovered on first use (or on `connect()`), patched on MOVED, and
/// rebuilt wholesale on READONLY, on redirect exhaustion and on the
/// optional refresh timer.
pub struct ClusterRouter {
    shared: Arc<Shared>,
    refresh_interval: Option<Duration>,
    refresher_started: AtomicBool,
}

/// State the background refresh task reaches through a `Weak`.
struct Shared {
    topology: ClusterTopology,
    pool: NodePool,
    /// Credentials for nodes learned from the cluster. Cluster nodes only
    /// have database 0.
    template: NodeDescriptor,
    max_redirects: usize,
    /// Held while a rediscovery runs so concurrent triggers collapse into one.
    rediscovery: tokio::sync::Mutex<()>,
    active: AtomicBool,
}

impl ClusterRouter {
    pub fn new(
        seeds: Vec<NodeDescriptor>,
        opts: ConnectionOptions,
        max_redirects: usize,
        auto_connect: bool,
        refresh_interval: Option<Duration>,
    ) -> Result<Self> {
        let Some(first) = seeds.first() else {
            return Err(RsedisError::Config(
                "at least one seed node is required".into(),
            ));
        };
        let template = first.clone().with_db(0);
        Ok(Self {
            shared: Arc::new(Shared {
                topology: ClusterTopology::new(seeds),
                pool: NodePool::new(opts),
                template,
                max_redirects,
                rediscovery: tokio::sync::Mutex::new(()),
                active: AtomicBool::new(auto_connect),
            }),
            refresh_interval,
            refresher_started: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(
            config.nodes.clone(),
            ConnectionOptions::from_config(config),
            config.max_redirects,
            config.auto_connect,
            config.slot_refresh_interval(),
        )
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.shared.topology
    }

    /// Number of nodes with a connection entry.
    pub fn node_count(&self) -> usize {
        self.shared.pool.len()
    }

    /// Rebuild the slot map now.
    pub async fn refresh(&self) -> Result<()> {
        self.shared.rediscover(self.shared.topology.epoch()).await
    }

    /// Spawn the periodic refresh task once, if configured.
    fn start_refresher(&self) {
        let Some(every) = self.refresh_interval else {
            return;
        };
        if self.refresher_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(shared) = weak.upgrade() else {
                    break; // Router dropped, exit
                };
                if !shared.active.load(Ordering::Acquire) {
                    continue;
                }
                let epoch = shared.topology.epoch();
                if let Err(e) = shared.rediscover(epoch).await {
                    warn!(error = %e, "periodic slot refresh failed");
                }
            }
        });
    }
}

impl Shared {
    fn check_active(&self) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RsedisError::NotConnected(
                "client is closed or was never connected".into(),
            ))
        }
    }

    fn node_for(&self, addr: &str) -> Result<NodeDescriptor> {
        let (host, port) = split_addr(addr).ok_or_else(|| {
            RsedisError::TopologyUnavailable(format!("invalid node address {addr:?}"))
        })?;
        Ok(self.template.relocated(host, port))
    }

    fn conn_for(&self, addr: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.pool.get(addr) {
            return Ok(conn);
        }
        Ok(self.pool.get_or_create(&self.node_for(addr)?))
    }

    /// Master for `cmd` in `map`: the slot owner, or any master for
    /// keyless commands.
    fn lookup(map: &SlotMap, cmd: &Command) -> Option<String> {
        let addr = match cmd.routing_key() {
            Some(key) => map.master_for_slot(key_slot(key)),
            None => map.first_master(),
        };
        addr.map(str::to_owned)
    }

    /// Address `cmd` should be sent to, discovering the slot map if it
    /// has no answer.
    async fn target(&self, cmd: &Command) -> Result<String> {
        let epoch = self.topology.epoch();
        if let Some(addr) = Self::lookup(&self.topology.snapshot(), cmd) {
            return Ok(addr);
        }
        self.rediscover(epoch).await?;
        Self::lookup(&self.topology.snapshot(), cmd).ok_or_else(|| {
            RsedisError::TopologyUnavailable(match cmd.routing_key() {
                Some(key) => format!("no node serves slot {}", key_slot(key)),
                None => "cluster reports no masters".into(),
            })
        })
    }

    /// Rebuild the slot map unless someone already did since `seen`.
    async fn rediscover(&self, seen: u64) -> Result<()> {
        let _guard = self.rediscovery.lock().await;
        if self.topology.epoch() != seen {
            return Ok(());
        }

        debug!(epoch = seen, "discovering cluster slots");
        let map = self.discover().await?;
        let masters = map.masters().len();
        let mut keep: HashSet<String> = map.addrs().into_iter().map(str::to_owned).collect();
        keep.extend(self.topology.seeds().iter().map(NodeDescriptor::addr));

        let epoch = self.topology.replace(map);
        let dropped = self.pool.retain(|addr| keep.contains(addr));
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "closing connections to departed nodes");
        }
        for conn in dropped {
            conn.close().await;
        }
        info!(epoch, masters, "cluster topology refreshed");
        Ok(())
    }

    /// Ask the seeds, then every known master, for the slot map.
    async fn discover(&self) -> Result<SlotMap> {
        let mut candidates: Vec<NodeDescriptor> = self
            .topology
            .seeds()
            .iter()
            .map(|seed| self.template.relocated(seed.host.as_str(), seed.port))
            .collect();
        for addr in self.topology.snapshot().masters() {
            if let Ok(node) = self.node_for(addr) {
                if !candidates.iter().any(|c| c.addr() == node.addr()) {
                    candidates.push(node);
                }
            }
        }

        let mut last = String::from("no candidates");
        for node in candidates {
            let conn = self.pool.get_or_create(&node);
            match discover_from(&conn).await {
                Ok(map) if !map.is_empty() => return Ok(map),
                Ok(_) => last = format!("{} reports no slots", conn.addr()),
                Err(e) => {
                    debug!(addr = %conn.addr(), error = %e, "slot discovery failed");
                    last = format!("{}: {e}", conn.addr());
                }
            }
        }
        Err(RsedisError::TopologyUnavailable(format!(
            "no node answered slot discovery (last: {last})"
        )))
    }

    /// Follow redirects in `reply` until a final answer or the hop limit.
    async fn follow(&self, cmd: &Command, mut reply: Reply) -> Result<Reply> {
        let mut hops = 0;
        while let Some(redirect) = Redirect::from_reply(&reply) {
            if hops == self.max_redirects {
                let last = reply.as_error_msg().unwrap_or_default().to_string();
                warn!(hops, error = %last, "redirect limit reached");
                if let Err(e) = self.rediscover(self.topology.epoch()).await {
                    debug!(error = %e, "rediscovery after redirect limit failed");
                }
                return Err(RsedisError::RedirectExhausted {
                    redirects: hops,
                    last,
                });
            }
            hops += 1;

            reply = match redirect {
                Redirect::Moved { slot, addr } => {
                    let conn = self.conn_for(&addr)?;
                    debug!(slot, to = %conn.addr(), hops, "MOVED");
                    self.topology.apply_moved(slot, conn.addr());
                    conn.execute(cmd).await?
                }
                Redirect::Ask { slot, addr } => {
                    let conn = self.conn_for(&addr)?;
                    debug!(slot, to = %conn.addr(), hops, "ASK");
                    conn.execute_asking(cmd).await?
                }
                Redirect::ReadOnly => {
                    debug!(hops, "READONLY, rebuilding slot map");
                    self.rediscover(self.topology.epoch()).await?;
                    let addr = self.target(cmd).await?;
                    self.conn_for(&addr)?.execute(cmd).await?
                }
            };
        }
        Ok(reply)
    }

    async fn submit(&self, cmd: &Command) -> Result<Reply> {
        self.check_active()?;
        let conn = self.conn_for(&self.target(cmd).await?)?;
        let reply = conn.execute(cmd).await?;
        self.follow(cmd, reply).await
    }

    /// Group `cmds` by node, send each group as one pipelined unit, then
    /// follow redirects per command.
    async fn submit_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        self.check_active()?;
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, cmd) in cmds.iter().enumerate() {
            let addr = self.target(cmd).await?;
            match groups.iter_mut().find(|(a, _)| *a == addr) {
                Some((_, idxs)) => idxs.push(i),
                None => groups.push((addr, vec![i])),
            }
        }

        let mut replies: Vec<Option<Reply>> = (0..cmds.len()).map(|_| None).collect();
        for (addr, idxs) in groups {
            let conn = self.conn_for(&addr)?;
            let batch: Vec<Command> = idxs.iter().map(|&i| cmds[i].clone()).collect();
            let out = conn.execute_batch(&batch).await?;
            for (i, reply) in idxs.into_iter().zip(out) {
                replies[i] = Some(self.follow(&cmds[i], reply).await?);
            }
        }
        replies
            .into_iter()
            .map(|r| r.ok_or_else(|| RsedisError::Protocol("missing reply".into())))
            .collect()
    }

    async fn connect(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        if self.topology.snapshot().is_empty() {
            self.rediscover(self.topology.epoch()).await?;
        }
        let map = self.topology.snapshot();
        for addr in map.masters() {
            self.conn_for(addr)?.connect().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.pool.close_all().await;
    }

    /// Slots are known and every master has an open connection.
    fn is_ready(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let map = self.topology.snapshot();
        let masters = map.masters();
        !masters.is_empty()
            && masters
                .iter()
                .all(|addr| self.pool.get(addr).is_some_and(|c| c.is_connected()))
    }
}

/// `CLUSTER SLOTS` on `conn`, or `CLUSTER NODES` if the node refuses it.
async fn discover_from(conn: &Connection) -> Result<SlotMap> {
    let host = conn.node().host.as_str();
    let reply = conn.execute(&cmd!("CLUSTER", "SLOTS")).await?;
    let Reply::Error(msg) = &reply else {
        return SlotMap::from_cluster_slots(&reply, host);
    };
    debug!(addr = %conn.addr(), error = %msg, "CLUSTER SLOTS refused, trying CLUSTER NODES");

    match conn.execute(&cmd!("CLUSTER", "NODES")).await? {
        Reply::Error(msg) => Err(RsedisError::redis(msg)),
        reply => match reply.as_str() {
            Some(text) => SlotMap::from_cluster_nodes(text, host),
            None => Err(RsedisError::Type(format!(
                "CLUSTER NODES: unexpected {} reply",
                reply.type_name()
            ))),
        },
    }
}

impl Router for ClusterRouter {
    async fn submit(&self, cmd: &Command) -> Result<Reply> {
        self.start_refresher();
        self.shared.submit(cmd).await
    }

    async fn submit_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.start_refresher();
        self.shared.submit_batch(cmds).await
    }

    async fn connect(&self) -> Result<()> {
        self.start_refresher();
        self.shared.connect().await
    }

    async fn close(&self) {
        self.shared.close().await;
    }

    fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
