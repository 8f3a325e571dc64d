//! Redis client and Pipeline.
//!
//! [`Client`] is the entry point: it picks a standalone or cluster router
//! from [`ClientConfig`] and exposes `submit`, `submit_batch`, `connect`
//! and `close`. Redirects are followed inside the router and never reach
//! the caller unless the hop limit is exceeded.

use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::resp::command::Command;
use crate::resp::types::Reply;
use crate::router::{ClusterRouter, Router, StandaloneRouter};

// ── Client ─────────────────────────────────────────────────────────

/// The router a client was configured with.
enum Routing {
    Standalone(StandaloneRouter),
    Cluster(ClusterRouter),
}

impl Router for Routing {
    async fn submit(&self, cmd: &Command) -> Result<Reply> {
        match self {
            Self::Standalone(r) => r.submit(cmd).await,
            Self::Cluster(r) => r.submit(cmd).await,
        }
    }

    async fn submit_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        match self {
            Self::Standalone(r) => r.submit_batch(cmds).await,
            Self::Cluster(r) => r.submit_batch(cmds).await,
        }
    }

    async fn connect(&self) -> Result<()> {
        match self {
            Self::Standalone(r) => r.connect().await,
            Self::Cluster(r) => r.connect().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Standalone(r) => r.close().await,
            Self::Cluster(r) => r.close().await,
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::Standalone(r) => r.is_ready(),
            Self::Cluster(r) => r.is_ready(),
        }
    }
}

/// An async Redis client.
///
/// Cheap to clone; clones share connections and (in cluster mode) the
/// slot map.
///
/// ```no_run
/// # async fn demo() -> rsedis::Result<()> {
/// use rsedis::{cmd, Client, ClientConfig};
///
/// let client = Client::new(ClientConfig::from_url("redis://127.0.0.1:6379/0")?)?;
/// client.submit(&cmd!("SET", "greeting", "hello")).await?;
/// let reply = client.submit(&cmd!("GET", "greeting")).await?;
/// assert_eq!(reply.as_str(), Some("hello"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    router: Arc<Routing>,
    config: Arc<ClientConfig>,
}

impl Client {
    /// Create a client. Nothing is connected yet: with `auto_connect` the
    /// first command connects, otherwise call [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let router = if config.cluster {
            Routing::Cluster(ClusterRouter::from_config(&config)?)
        } else {
            Routing::Standalone(StandaloneRouter::from_config(&config)?)
        };
        debug!(
            cluster = config.cluster,
            nodes = config.nodes.len(),
            auto_connect = config.auto_connect,
            "client created"
        );
        Ok(Self {
            router: Arc::new(router),
            config: Arc::new(config),
        })
    }

    /// Create a client from a `redis://`, `rediss://`, `redis+cluster://`
    /// or `rediss+cluster://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ClientConfig::from_url(url)?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_cluster(&self) -> bool {
        matches!(*self.router, Routing::Cluster(_))
    }

    /// Send one command and return its reply.
    ///
    /// Error replies are data: `Ok(Reply::Error(..))`. Use
    /// [`Reply::into_result`] to turn them into errors.
    pub async fn submit(&self, cmd: &Command) -> Result<Reply> {
        self.router.submit(cmd).await
    }

    /// Send `cmds` pipelined; replies come back in the same order.
    pub async fn submit_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        self.router.submit_batch(cmds).await
    }

    /// Connect now (and, in cluster mode, discover the slot map).
    pub async fn connect(&self) -> Result<()> {
        self.router.connect().await
    }

    /// Close all connections. Commands fail with `NotConnected` until
    /// [`connect`](Self::connect) is called again.
    pub async fn close(&self) {
        self.router.close().await
    }

    /// True when the node (or, in cluster mode, every master) has an open
    /// connection and the client has not been closed.
    pub fn is_ready(&self) -> bool {
        self.router.is_ready()
    }

    /// Start an empty pipeline.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            commands: Vec::new(),
            router: Arc::clone(&self.router),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addrs: Vec<String> = self.config.nodes.iter().map(|n| n.addr()).collect();
        f.debug_struct("Client")
            .field("cluster", &self.config.cluster)
            .field("nodes", &addrs)
            .finish()
    }
}

// ── Pipeline ───────────────────────────────────────────────────────

/// Buffers commands and sends them in one round trip.
///
/// ```no_run
/// # async fn demo(client: rsedis::Client) -> rsedis::Result<()> {
/// use rsedis::cmd;
///
/// let mut pipe = client.pipeline();
/// pipe.add(cmd!("SET", "a", 1)).add(cmd!("SET", "b", 2)).add(cmd!("MGET", "a", "b"));
/// let replies = pipe.execute().await?;
/// assert_eq!(replies.len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    commands: Vec<Command>,
    router: Arc<Routing>,
}

impl Pipeline {
    /// Add a command to the pipeline.
    pub fn add(&mut self, cmd: Command) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    /// Number of commands in the pipeline.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Reset the pipeline, discarding all buffered commands.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    /// Execute all buffered commands; the pipeline is empty afterwards
    /// whether or not the batch succeeded.
    pub async fn execute(&mut self) -> Result<Vec<Reply>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut self.commands);
        self.router.submit_batch(&commands).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pipeline(commands={})", self.commands.len())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
