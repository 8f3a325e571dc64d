//! A shared connection to one node.
//!
//! Every unit of work (one command, or one pipelined batch) holds the
//! execution lock from the first byte written until its last reply has been
//! read. The lock is a `tokio::sync::Mutex`, which hands itself to waiters
//! in arrival order, so replies reach callers in exactly the order their
//! commands were written.
//!
//! When the stream fails, the caller that observed the failure gets the
//! underlying error, every caller already queued on the lock gets
//! `ConnectionLost`, and the next new caller reconnects (if allowed).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, CloseHook, NodeDescriptor, ReconnectPolicy};
use crate::connection::pending::PendingQueue;
use crate::connection::transport::{Transport, TransportOptions};
use crate::error::{Result, RsedisError};
use crate::resp::command::Command;
use crate::resp::types::Reply;
use crate::resp::writer::encode_batch;

/// How a [`Connection`] opens and re-opens its transport.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub transport: TransportOptions,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    /// Run when the stream fails; not on `close()`.
    pub on_close: Option<CloseHook>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            transport: TransportOptions::from_config(config),
            auto_reconnect: config.auto_reconnect,
            reconnect: config.reconnect.clone(),
            on_close: config.on_close.clone(),
        }
    }
}

/// Lifecycle of the underlying stream.
enum Link {
    /// Never connected; opened on first use.
    Idle,
    Open(Transport),
    /// Failed; reopened on next use when auto-reconnect is on.
    Broken,
    /// Closed by the owner; only `connect()` reopens it.
    Closed,
}

struct State {
    link: Link,
    pending: PendingQueue,
    /// Set while a write is in progress. Still set on the next lock means the
    /// writer was dropped mid-write and the stream holds a partial command.
    writing: bool,
}

/// One node's connection, shared by any number of concurrent callers.
pub struct Connection {
    node: NodeDescriptor,
    addr: String,
    opts: ConnectionOptions,
    state: Mutex<State>,
    /// Bumped on every stream failure. A caller whose arrival generation is
    /// stale by the time it holds the lock was queued on the failed stream.
    generation: AtomicU64,
    /// Mirrors `Link::Open` so readiness can be read without the lock.
    open: AtomicBool,
}

impl Connection {
    /// A connection to `node`; nothing is opened until first use or
    /// [`connect`](Self::connect).
    pub fn new(node: NodeDescriptor, opts: ConnectionOptions) -> Self {
        Self {
            addr: node.addr(),
            node,
            opts,
            state: Mutex::new(State {
                link: Link::Idle,
                pending: PendingQueue::new(),
                writing: false,
            }),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of stream failures seen so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True when a stream is currently open.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the stream now. No-op when already open.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(state.link, Link::Open(_)) {
            let transport = self.open(1).await?;
            self.set_link(&mut state, Link::Open(transport));
            state.pending.drain();
            state.writing = false;
        }
        Ok(())
    }

    /// Close the stream. Later commands fail with `NotConnected` until
    /// [`connect`](Self::connect) is called again.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Link::Open(_) = self.set_link(&mut state, Link::Closed) {
            debug!(addr = %self.addr, "connection closed");
        }
        state.pending.drain();
        state.writing = false;
    }

    /// Send one command and wait for its reply.
    ///
    /// Error replies come back as `Ok(Reply::Error(..))`.
    pub async fn execute(&self, cmd: &Command) -> Result<Reply> {
        let mut replies = self.run(std::slice::from_ref(cmd)).await?;
        replies
            .pop()
            .ok_or_else(|| RsedisError::Protocol("missing reply".into()))
    }

    /// Send `cmds` as one write and return their replies in the same order.
    pub async fn execute_batch(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.run(cmds).await
    }

    /// Send `ASKING` immediately followed by `cmd` in the same unit, and
    /// return the reply to `cmd`.
    pub async fn execute_asking(&self, cmd: &Command) -> Result<Reply> {
        let batch = [Command::new("ASKING"), cmd.clone()];
        let mut replies = self.run(&batch).await?;
        if let Some(Reply::Error(msg)) = replies.first() {
            debug!(addr = %self.addr, error = %msg, "ASKING rejected");
        }
        replies
            .pop()
            .ok_or_else(|| RsedisError::Protocol("missing reply".into()))
    }

    /// One unit of work under the execution lock.
    async fn run(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        let arrived = self.generation.load(Ordering::Acquire);
        let mut guard = self.state.lock().await;
        if self.generation.load(Ordering::Acquire) != arrived {
            return Err(RsedisError::ConnectionLost(format!(
                "connection to {} failed while the request was queued",
                self.addr
            )));
        }
        let state = &mut *guard;
        self.ensure_open(state).await?;

        let State {
            link,
            pending,
            writing,
        } = &mut *state;
        let Link::Open(transport) = link else {
            return Err(RsedisError::NotConnected(self.addr.clone()));
        };

        match exchange(transport, pending, writing, cmds).await {
            Ok(replies) => Ok(replies),
            Err(e) => {
                self.fail(state, &e);
                Err(e)
            }
        }
    }

    /// Bring the link to `Open`, reconnecting if policy allows.
    ///
    /// A stream left holding a partial command by a caller dropped mid-write
    /// is discarded and reopened like a fresh connection. The node did not
    /// fail, so this happens even with auto-reconnect off, without bumping
    /// the generation or running the close hook.
    async fn ensure_open(&self, state: &mut State) -> Result<()> {
        if state.writing {
            warn!(addr = %self.addr, "previous write was interrupted, dropping stream");
            state.pending.drain();
            state.writing = false;
            self.set_link(state, Link::Idle);
        }
        match state.link {
            Link::Open(_) => Ok(()),
            Link::Idle => {
                let transport = self.open(1).await?;
                self.set_link(state, Link::Open(transport));
                Ok(())
            }
            Link::Broken => {
                let attempts = self.opts.reconnect.max_attempts;
                if !self.opts.auto_reconnect || attempts == 0 {
                    return Err(RsedisError::NotConnected(format!(
                        "connection to {} failed and auto-reconnect is disabled",
                        self.addr
                    )));
                }
                let transport = self.open(attempts).await?;
                info!(addr = %self.addr, "reconnected");
                self.set_link(state, Link::Open(transport));
                Ok(())
            }
            Link::Closed => Err(RsedisError::NotConnected(format!(
                "connection to {} is closed",
                self.addr
            ))),
        }
    }

    /// Try to open a transport up to `attempts` times with backoff.
    async fn open(&self, attempts: u32) -> Result<Transport> {
        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            let delay = self.opts.reconnect.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match Transport::connect(&self.node, &self.opts.transport).await {
                Ok(transport) => return Ok(transport),
                // Handshake refusals (bad password, bad db) will not improve.
                Err(e) if !e.is_connection_failure() => return Err(e),
                Err(e) => {
                    debug!(addr = %self.addr, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RsedisError::NotConnected(self.addr.clone())))
    }

    /// Tear the stream down after `err`. Requests in flight are dropped,
    /// callers queued on the lock will see `ConnectionLost` and the close
    /// hook, if any, is told which node went away.
    fn fail(&self, state: &mut State, err: &RsedisError) {
        let in_flight = state.pending.len();
        state.pending.drain();
        state.writing = false;
        self.set_link(state, Link::Broken);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            addr = %self.addr,
            error = %err,
            in_flight,
            generation,
            "connection failed"
        );
        if let Some(hook) = &self.opts.on_close {
            hook.call(&self.addr);
        }
    }

    /// Swap the link, keeping `open` in step. Returns the previous link.
    fn set_link(&self, state: &mut State, link: Link) -> Link {
        self.open
            .store(matches!(link, Link::Open(_)), Ordering::Release);
        std::mem::replace(&mut state.link, link)
    }
}

/// Write `cmds` as one buffer and read one reply per command.
///
/// Replies owed to an earlier caller that stopped waiting are read and
/// discarded first, so the stream stays aligned with the queue.
async fn exchange(
    transport: &mut Transport,
    pending: &mut PendingQueue,
    writing: &mut bool,
    cmds: &[Command],
) -> Result<Vec<Reply>> {
    while !pending.is_empty() {
        transport.read_reply().await?;
        if let Some(stale) = pending.complete() {
            debug!(addr = %transport.addr(), seq = stale.seq, "discarded abandoned reply");
        }
    }

    let payload = encode_batch(cmds);
    for cmd in cmds {
        pending.push(cmd);
    }
    *writing = true;
    transport.send_raw(&payload).await?;
    *writing = false;

    let mut replies = Vec::with_capacity(cmds.len());
    for _ in cmds {
        let reply = transport.read_reply().await?;
        pending.complete();
        replies.push(reply);
    }
    Ok(replies)
}

// ── Tests ──────────────────────────────────────────────────────────
