pub mod cluster;
pub mod standalone;
pub mod topology;

pub use cluster::ClusterRouter;
pub use standalone::StandaloneRouter;
pub use topology::{ClusterTopology, Shard, SlotMap};

use std::collections::HashMap;

use crate::error::{RedisErrorKind, Result};
use crate::resp::command::Command;
use crate::resp::types::Reply;

/// Common interface for all Redis topology routers.
///
/// Implementations handle the details of single-server or cluster
/// deployments behind a uniform API. Error replies that are not
/// redirects come back as `Ok(Reply::Error(..))`.
pub trait Router: Send + Sync {
    /// Execute a single command and return its reply.
    fn submit(&self, cmd: &Command) -> impl std::future::Future<Output = Result<Reply>> + Send;

    /// Execute a batch of commands; replies come back in submission order.
    fn submit_batch(
        &self,
        cmds: &[Command],
    ) -> impl std::future::Future<Output = Result<Vec<Reply>>> + Send;

    /// Open connections now and allow commands to be submitted.
    fn connect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Close every connection; commands fail with `NotConnected` until the
    /// next `connect()`.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// True when commands can be sent without opening a connection first.
    fn is_ready(&self) -> bool;
}

/// An error reply that tells the client to try somewhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot has permanently moved to `addr`.
    Moved { slot: u16, addr: String },
    /// The slot is migrating; this one command should go to `addr`.
    Ask { slot: u16, addr: String },
    /// A write reached a replica.
    ReadOnly,
}

impl Redirect {
    /// Classify `reply`; `None` for anything that is not a redirect.
    pub fn from_reply(reply: &Reply) -> Option<Self> {
        let msg = reply.as_error_msg()?;
        match RedisErrorKind::from_error_msg(msg) {
            RedisErrorKind::Moved { slot, addr } => Some(Self::Moved { slot, addr }),
            RedisErrorKind::Ask { slot, addr } => Some(Self::Ask { slot, addr }),
            RedisErrorKind::ReadOnly => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

/// Parse the text of an `INFO` reply into `field → value`.
///
/// `# Section` headers and blank lines are skipped.
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Split `host:port` (IPv6 hosts may be bracketed).
pub(crate) fn split_addr(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

// ── Tests ──────────────────────────────────────────────────────────
