//! Requests written to a connection whose replies have not arrived yet.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::resp::command::Command;

/// One command on the wire, waiting for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Position in the connection's write order.
    pub seq: u64,
    /// Command name, kept for diagnostics.
    pub name: Bytes,
}

/// FIFO of written-but-unanswered requests on one connection.
///
/// Replies are matched strictly front to back: the next reply read from the
/// stream always belongs to the oldest entry.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<PendingRequest>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cmd` as written; returns its sequence number.
    pub fn push(&mut self, cmd: &Command) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(PendingRequest {
            seq,
            name: cmd.parts()[0].clone(),
        });
        seq
    }

    /// The request the next reply answers.
    pub fn complete(&mut self) -> Option<PendingRequest> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Remove every entry, oldest first. Each is resolved exactly once by
    /// whoever drains it.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.queue.drain(..).collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
