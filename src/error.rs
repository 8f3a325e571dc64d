use std::io;
use thiserror::Error;

// ── Error taxonomy ─────────────────────────────────────────────────
//
//  RsedisError
//  ├── Io                  transport could not be opened / written / read
//  ├── Protocol            malformed RESP bytes, fatal to the connection
//  ├── ConnectionLost      request was queued on a connection that failed
//  ├── NotConnected        connection closed or never established
//  ├── Redis               an error reply surfaced as a Rust error
//  ├── RedirectExhausted   MOVED/ASK/READONLY chain exceeded the bound
//  ├── TopologyUnavailable no seed answered slot discovery
//  ├── Timeout
//  ├── Config
//  └── Type

/// Structured Redis error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// MOVED slot host:port  (cluster)
    Moved { slot: u16, addr: String },
    /// ASK slot host:port  (cluster)
    Ask { slot: u16, addr: String },
    /// CLUSTERDOWN
    ClusterDown,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// TRYAGAIN
    TryAgain,
    /// Any other Redis error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Classify a Redis error message (e.g. "WRONGTYPE Operation against…").
    pub fn from_error_msg(msg: &str) -> Self {
        if let Some(rest) = msg.strip_prefix("MOVED ") {
            return match parse_slot_addr(rest) {
                Some((slot, addr)) => Self::Moved { slot, addr },
                None => Self::Other("MOVED".to_string()),
            };
        }
        if let Some(rest) = msg.strip_prefix("ASK ") {
            return match parse_slot_addr(rest) {
                Some((slot, addr)) => Self::Ask { slot, addr },
                None => Self::Other("ASK".to_string()),
            };
        }

        let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
        match prefix {
            "ERR" => Self::Err,
            "WRONGTYPE" => Self::WrongType,
            "CLUSTERDOWN" => Self::ClusterDown,
            "LOADING" => Self::Loading,
            "READONLY" => Self::ReadOnly,
            "NOSCRIPT" => Self::NoScript,
            "BUSY" => Self::Busy,
            "TRYAGAIN" => Self::TryAgain,
            other => Self::Other(other.to_string()),
        }
    }
}

/// `<slot> <host>:<port>` as found after MOVED / ASK.
fn parse_slot_addr(rest: &str) -> Option<(u16, String)> {
    let (slot_str, addr) = rest.trim().split_once(' ')?;
    let slot = slot_str.parse::<u16>().ok()?;
    let addr = addr.trim();
    // The address must at least carry a port.
    let (_, port) = addr.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    Some((slot, addr.to_string()))
}

/// All error variants for rsedis.
#[derive(Debug, Error)]
pub enum RsedisError {
    /// TCP / IO level errors
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// Malformed RESP data. The connection it arrived on is torn down.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection failed while this request was queued on it.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection is closed (explicitly, or after a failure with
    /// auto-reconnect disabled).
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Redis returned an error reply.
    #[error("redis error: {message}")]
    Redis {
        kind: RedisErrorKind,
        message: String,
    },

    /// Too many MOVED / ASK / READONLY hops; carries the last error text.
    #[error("redirect limit of {redirects} exceeded, last error: {last}")]
    RedirectExhausted { redirects: usize, last: String },

    /// No seed node could be reached or none reported a usable slot map.
    #[error("cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration or URL
    #[error("config error: {0}")]
    Config(String),

    /// Reply had an unexpected shape for the caller's projection.
    #[error("type error: {0}")]
    Type(String),
}

impl RsedisError {
    /// Create a Redis error from a raw error message, auto-parsing the kind.
    pub fn redis(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = RedisErrorKind::from_error_msg(&message);
        Self::Redis { kind, message }
    }

    /// Check if this is a MOVED redirect.
    pub fn is_moved(&self) -> bool {
        matches!(
            self,
            Self::Redis {
                kind: RedisErrorKind::Moved { .. },
                ..
            }
        )
    }

    /// Check if this is an ASK redirect.
    pub fn is_ask(&self) -> bool {
        matches!(
            self,
            Self::Redis {
                kind: RedisErrorKind::Ask { .. },
                ..
            }
        )
    }

    /// Extract MOVED slot and address if this is a MOVED error.
    pub fn moved_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Redis {
                kind: RedisErrorKind::Moved { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }

    /// Extract ASK slot and address if this is an ASK error.
    pub fn ask_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Redis {
                kind: RedisErrorKind::Ask { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }

    /// True for errors after which the connection that produced them is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::ConnectionLost(_)
                | Self::NotConnected(_)
                | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RsedisError>;

// ── Tests ──────────────────────────────────────────────────────────
