//! Client configuration and URL parsing.
//!
//! Supports the following URL schemes:
//! - `redis://[user:pass@]host[:port][/db]`                     : direct
//! - `rediss://[user:pass@]host[:port][/db]`                    : direct + TLS
//! - `redis+cluster://[user:pass@]host[:port][,host[:port]…][/db]`: cluster
//! - `rediss+cluster://…`                                       : cluster + TLS

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RsedisError};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default bound on MOVED / ASK / READONLY hops for one command.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default maximum receive buffer size per connection (512 MB).
pub const DEFAULT_MAX_BUF_SIZE: usize = 512 * 1024 * 1024;

/// One Redis node: where it is and how to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    /// Logical database selected after connecting.
    pub db: u16,
    /// Optional username (Redis 6+ ACL).
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for NodeDescriptor {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl NodeDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            username: None,
            password: None,
        }
    }

    pub fn with_db(mut self, db: u16) -> Self {
        self.db = db;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// A node at another address sharing this node's database and credentials.
    ///
    /// Used for nodes learned from the server (cluster members, a replica's
    /// master) rather than from configuration.
    pub fn relocated(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..self.clone()
        }
    }
}

/// Backoff schedule for re-establishing a failed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Connect attempts per reconnect; 0 disables reconnecting.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub base_delay_ms: u64,
    /// Cap on the delay between attempts.
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt number `attempt` (0-based). The first attempt
    /// is immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Callback run with a node's `host:port` when its connection drops
/// without `close()` having been called.
#[derive(Clone)]
pub struct CloseHook(Arc<dyn Fn(&str) + Send + Sync>);

impl CloseHook {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, addr: &str) {
        (self.0)(addr)
    }
}

impl fmt::Debug for CloseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloseHook")
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Direct mode: exactly one node. Cluster mode: seed nodes.
    pub nodes: Vec<NodeDescriptor>,
    /// Route by hash slot and follow cluster redirects.
    pub cluster: bool,
    /// Connect lazily on first use. When false, commands fail with
    /// `NotConnected` until `connect()` is called.
    pub auto_connect: bool,
    /// Re-establish a failed connection on next use.
    pub auto_reconnect: bool,
    /// Whether to use TLS.
    pub tls: bool,
    /// Bound on redirect hops per command.
    pub max_redirects: usize,
    pub reconnect: ReconnectPolicy,
    /// Connect timeout in milliseconds (0 = no timeout).
    pub connect_timeout_ms: u64,
    /// Read/response timeout in milliseconds (0 = no timeout, default 30s).
    pub read_timeout_ms: u64,
    /// Maximum read buffer size per connection in bytes.
    pub max_buffer_size: usize,
    /// Background slot map refresh period in milliseconds (0 = off).
    pub slot_refresh_interval_ms: u64,
    /// Notified when a connection fails unexpectedly.
    pub on_close: Option<CloseHook>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeDescriptor::default()],
            cluster: false,
            auto_connect: true,
            auto_reconnect: true,
            tls: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 30_000,
            max_buffer_size: DEFAULT_MAX_BUF_SIZE,
            slot_refresh_interval_ms: 0,
            on_close: None,
        }
    }
}

impl ClientConfig {
    /// Direct-mode config for one node.
    pub fn direct(node: NodeDescriptor) -> Self {
        Self {
            nodes: vec![node],
            ..Self::default()
        }
    }

    /// Cluster-mode config bootstrapping from `seeds`.
    pub fn cluster(seeds: Vec<NodeDescriptor>) -> Self {
        Self {
            nodes: seeds,
            cluster: true,
            ..Self::default()
        }
    }

    /// Parse a Redis URL into a ClientConfig.
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| RsedisError::Config(format!("invalid URL, missing ://: {url}")))?;

        let mut config = Self::default();
        match scheme {
            "redis" => {}
            "rediss" => config.tls = true,
            "redis+cluster" => config.cluster = true,
            "rediss+cluster" => {
                config.cluster = true;
                config.tls = true;
            }
            _ => {
                return Err(RsedisError::Config(format!(
                    "unknown URL scheme: {scheme}"
                )));
            }
        }

        let (host_part, db_part) = split_path(rest);
        let db = match db_part {
            Some(db_str) => db_str
                .parse()
                .map_err(|_| RsedisError::Config(format!("invalid db number: {db_str}")))?,
            None => 0,
        };

        // Split off user:pass@ prefix
        let (userinfo, hosts) = match host_part.rsplit_once('@') {
            Some((userinfo, hosts)) => (Some(userinfo), hosts),
            None => (None, host_part),
        };
        let (username, password) = userinfo.map(parse_userinfo).unwrap_or((None, None));

        let mut nodes = Vec::new();
        for addr in hosts.split(',') {
            let addr = addr.trim();
            if addr.is_empty() && !nodes.is_empty() {
                continue;
            }
            let (host, port) = parse_host_port(addr, DEFAULT_PORT)?;
            nodes.push(NodeDescriptor {
                host,
                port,
                db,
                username: username.clone(),
                password: password.clone(),
            });
        }
        config.nodes = nodes;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(RsedisError::Config("at least one node is required".into()));
        }
        if !self.cluster && self.nodes.len() > 1 {
            return Err(RsedisError::Config(format!(
                "{} nodes given without cluster mode; direct mode takes exactly one",
                self.nodes.len()
            )));
        }
        if self.max_redirects == 0 {
            return Err(RsedisError::Config("max_redirects must be at least 1".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(RsedisError::Config("max_buffer_size must be non-zero".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(RsedisError::Config(
                "reconnect base delay exceeds its maximum".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn slot_refresh_interval(&self) -> Option<Duration> {
        (self.slot_refresh_interval_ms > 0)
            .then(|| Duration::from_millis(self.slot_refresh_interval_ms))
    }
}

// ── URL parsing helpers ────────────────────────────────────────────

/// Split `rest` into (before_path, Some(path)) or (rest, None).
fn split_path(rest: &str) -> (&str, Option<&str>) {
    match rest.split_once('/') {
        Some((before, after)) if !after.is_empty() => (before, Some(after)),
        Some((before, _)) => (before, None),
        None => (rest, None),
    }
}

/// `user:pass`, `:pass` or a bare password.
fn parse_userinfo(userinfo: &str) -> (Option<String>, Option<String>) {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    match userinfo.split_once(':') {
        Some((user, pass)) => (non_empty(user), non_empty(pass)),
        None => (None, non_empty(userinfo)),
    }
}

/// Parse `host[:port]` or `[ipv6]:port`.
fn parse_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = if let Some(bracketed) = s.strip_prefix('[') {
        // IPv6 in brackets: [::1]:6379
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| RsedisError::Config(format!("unclosed IPv6 bracket: {s}")))?;
        let port = match after.strip_prefix(':') {
            Some(port_str) => parse_port(port_str)?,
            None => default_port,
        };
        (host.to_string(), port)
    } else if let Some((h, p)) = s.rsplit_once(':') {
        match p.parse::<u16>() {
            Ok(port) => (h.to_string(), port),
            // Bare IPv6 without a port
            Err(_) if h.contains(':') => (s.to_string(), default_port),
            Err(_) => return Err(RsedisError::Config(format!("invalid port: {p}"))),
        }
    } else {
        (s.to_string(), default_port)
    };

    if host.is_empty() {
        Ok(("127.0.0.1".to_string(), port))
    } else {
        Ok((host, port))
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| RsedisError::Config(format!("invalid port: {s}")))
}

// ── Tests ──────────────────────────────────────────────────────────
