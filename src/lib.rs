//! Async Redis client core.
//!
//! * [`resp`]: RESP2 codec (commands out, replies in).
//! * [`connection`]: one pipelined connection per node with strict
//!   request/reply ordering and lazy reconnect.
//! * [`router`]: standalone and Redis Cluster routing, including
//!   MOVED / ASK / READONLY handling.
//! * [`Client`]: the façade tying them together.

pub mod client;
pub mod config;
pub mod connection;
pub mod crc16;
pub mod error;
pub mod resp;
pub mod router;

pub use client::{Client, Pipeline};
pub use config::{ClientConfig, CloseHook, NodeDescriptor, ReconnectPolicy};
pub use error::{RedisErrorKind, Result, RsedisError};
pub use resp::{Command, IntoArg, Reply};
