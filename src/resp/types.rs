use bytes::Bytes;

use crate::error::{Result, RsedisError};

/// A decoded RESP reply.
///
/// Error replies are ordinary values here; only the caller decides whether
/// a `-ERR …` is a failure (see [`Reply::into_result`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK\r\n
    Status(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n, or `None` for $-1\r\n
    BulkString(Option<Bytes>),
    /// *2\r\n…, or `None` for *-1\r\n
    Array(Option<Vec<Reply>>),
}

// ── Convenience accessors ──────────────────────────────────────────

impl Reply {
    /// Shorthand for a present bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::BulkString(Some(data.into()))
    }

    /// Shorthand for a present array.
    pub fn array(items: Vec<Reply>) -> Self {
        Self::Array(Some(items))
    }

    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Status(s) => Some(s),
            Self::BulkString(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(Some(b)) => Some(b),
            Self::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Self::Array(Some(a)) => Some(a),
            _ => None,
        }
    }

    /// Returns true for the null bulk string and the null array.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::BulkString(None) | Self::Array(None))
    }

    /// Returns true when this is a Redis error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the error message if this is an error value.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Status(s) if s == "OK")
    }

    /// Turn an error reply into [`RsedisError::Redis`], pass anything else through.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Self::Error(msg) => Err(RsedisError::redis(msg)),
            other => Ok(other),
        }
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(Some(_)) => "bulk_string",
            Self::BulkString(None) => "null_bulk_string",
            Self::Array(Some(_)) => "array",
            Self::Array(None) => "null_array",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
