//! Cluster slot map.
//!
//! A [`SlotMap`] is an immutable snapshot: one owner index per hash slot
//! plus the list of shards (master and replicas). [`ClusterTopology`]
//! holds the current snapshot behind an `Arc` and swaps it whole, so a
//! reader either sees the old map or the new one, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::NodeDescriptor;
use crate::crc16::HASH_SLOTS;
use crate::error::{Result, RsedisError};
use crate::resp::types::Reply;

/// Marks a slot no shard serves.
const UNASSIGNED: u16 = u16::MAX;

/// A master and its replicas, as `host:port` addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub master: String,
    pub replicas: Vec<String>,
}

impl Shard {
    pub fn new(master: impl Into<String>) -> Self {
        Self {
            master: master.into(),
            replicas: Vec::new(),
        }
    }
}

/// Hash slot → shard lookup table.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Box<[u16]>,
    shards: Vec<Shard>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl SlotMap {
    /// A map with no slot assigned.
    pub fn empty() -> Self {
        Self {
            slots: vec![UNASSIGNED; HASH_SLOTS as usize].into_boxed_slice(),
            shards: Vec::new(),
        }
    }

    /// Build from `(first_slot, last_slot, shard)` ranges, inclusive.
    ///
    /// Ranges served by the same master share one shard entry.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (u16, u16, Shard)>) -> Result<Self> {
        let mut map = Self::empty();
        for (start, end, shard) in ranges {
            if start > end || end >= HASH_SLOTS {
                return Err(RsedisError::Type(format!(
                    "invalid slot range {start}-{end}"
                )));
            }
            let idx = map.shard_index(shard);
            map.slots[start as usize..=end as usize].fill(idx);
        }
        Ok(map)
    }

    /// Parse a `CLUSTER SLOTS` reply.
    ///
    /// Each entry is `[start, end, [host, port, id..], replica..]`. An empty
    /// host means "the node you asked", so `origin_host` stands in for it.
    pub fn from_cluster_slots(reply: &Reply, origin_host: &str) -> Result<Self> {
        let Reply::Array(Some(entries)) = reply else {
            return Err(RsedisError::Type(format!(
                "CLUSTER SLOTS: expected array, got {}",
                reply.type_name()
            )));
        };

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let Reply::Array(Some(items)) = entry else {
                continue;
            };
            if items.len() < 3 {
                continue;
            }
            let start = slot_number(&items[0])?;
            let end = slot_number(&items[1])?;
            let mut shard = Shard::new(node_addr(&items[2], origin_host)?);
            shard.replicas = items[3..]
                .iter()
                .filter_map(|n| node_addr(n, origin_host).ok())
                .collect();
            ranges.push((start, end, shard));
        }
        Self::from_ranges(ranges)
    }

    /// Parse the text of a `CLUSTER NODES` reply.
    ///
    /// Line format: `<id> <ip:port@cport[,hostname]> <flags> <master-id>
    /// <ping> <pong> <epoch> <link> <slot>...`. Migration markers
    /// (`[slot->-id]`, `[slot-<-id]`) are ignored; replicas attach to their
    /// master's shard.
    pub fn from_cluster_nodes(text: &str, origin_host: &str) -> Result<Self> {
        struct Node<'a> {
            addr: String,
            master_id: &'a str,
            is_master: bool,
            slots: Vec<(u16, u16)>,
        }

        let mut nodes: HashMap<&str, Node<'_>> = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                continue;
            }
            let flags: Vec<&str> = fields[2].split(',').collect();
            if flags.iter().any(|f| matches!(*f, "noaddr" | "handshake" | "fail")) {
                continue;
            }
            let endpoint = fields[1].split(['@', ',']).next().unwrap_or_default();
            let Some((host, port)) = endpoint.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            let host = if host.is_empty() { origin_host } else { host };

            let mut slots = Vec::new();
            for &range in &fields[8..] {
                if range.starts_with('[') {
                    continue;
                }
                let (a, b) = range.split_once('-').unwrap_or((range, range));
                match (a.parse::<u16>(), b.parse::<u16>()) {
                    (Ok(a), Ok(b)) => slots.push((a, b)),
                    _ => {
                        return Err(RsedisError::Type(format!(
                            "CLUSTER NODES: bad slot range {range}"
                        )))
                    }
                }
            }

            nodes.insert(
                fields[0],
                Node {
                    addr: NodeDescriptor::new(host, port).addr(),
                    master_id: fields[3],
                    is_master: flags.contains(&"master"),
                    slots,
                },
            );
        }

        let mut ranges = Vec::new();
        for (id, node) in &nodes {
            if !node.is_master || node.slots.is_empty() {
                continue;
            }
            let mut shard = Shard::new(node.addr.clone());
            shard.replicas = nodes
                .values()
                .filter(|n| !n.is_master && n.master_id == *id)
                .map(|n| n.addr.clone())
                .collect();
            shard.replicas.sort();
            for &(start, end) in &node.slots {
                ranges.push((start, end, shard.clone()));
            }
        }
        Self::from_ranges(ranges)
    }

    /// Master serving `slot`.
    pub fn master_for_slot(&self, slot: u16) -> Option<&str> {
        self.shard_for_slot(slot).map(|s| s.master.as_str())
    }

    /// Replicas of the master serving `slot`.
    pub fn replicas_for_slot(&self, slot: u16) -> &[String] {
        self.shard_for_slot(slot)
            .map(|s| s.replicas.as_slice())
            .unwrap_or_default()
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        match *self.slots.get(slot as usize)? {
            UNASSIGNED => None,
            idx => self.shards.get(idx as usize),
        }
    }

    /// Master of the lowest assigned slot; where keyless commands go.
    pub fn first_master(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|&&idx| idx != UNASSIGNED)
            .and_then(|&idx| self.shards.get(idx as usize))
            .map(|s| s.master.as_str())
    }

    /// Every master that serves at least one slot.
    pub fn masters(&self) -> Vec<&str> {
        let mut used = vec![false; self.shards.len()];
        for &idx in self.slots.iter().filter(|&&i| i != UNASSIGNED) {
            used[idx as usize] = true;
        }
        self.shards
            .iter()
            .zip(used)
            .filter(|(_, used)| *used)
            .map(|(s, _)| s.master.as_str())
            .collect()
    }

    /// Every address the map mentions, masters and replicas.
    pub fn addrs(&self) -> Vec<&str> {
        self.shards
            .iter()
            .flat_map(|s| std::iter::once(&s.master).chain(&s.replicas))
            .map(String::as_str)
            .collect()
    }

    /// Number of slots with an owner.
    pub fn assigned(&self) -> usize {
        self.slots.iter().filter(|&&i| i != UNASSIGNED).count()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned() == 0
    }

    /// A copy of this map with `slot` owned by `addr`.
    pub fn with_slot_moved(&self, slot: u16, addr: &str) -> Self {
        let mut next = self.clone();
        if slot < HASH_SLOTS {
            let idx = next.shard_index(Shard::new(addr));
            next.slots[slot as usize] = idx;
        }
        next
    }

    /// Index of the shard whose master is `shard.master`, adding it if new.
    fn shard_index(&mut self, shard: Shard) -> u16 {
        if let Some(i) = self.shards.iter().position(|s| s.master == shard.master) {
            if self.shards[i].replicas.is_empty() {
                self.shards[i].replicas = shard.replicas;
            }
            return i as u16;
        }
        self.shards.push(shard);
        (self.shards.len() - 1) as u16
    }
}

fn slot_number(reply: &Reply) -> Result<u16> {
    reply
        .as_int()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|&n| n < HASH_SLOTS)
        .ok_or_else(|| RsedisError::Type("CLUSTER SLOTS: invalid slot number".into()))
}

/// `[host, port, ...]` → `host:port`.
fn node_addr(reply: &Reply, origin_host: &str) -> Result<String> {
    let Reply::Array(Some(items)) = reply else {
        return Err(RsedisError::Type("CLUSTER SLOTS: expected node array".into()));
    };
    let (Some(host), Some(port)) = (
        items.first().and_then(Reply::as_str),
        items.get(1).and_then(Reply::as_int),
    ) else {
        return Err(RsedisError::Type("CLUSTER SLOTS: invalid node entry".into()));
    };
    let port = u16::try_from(port)
        .map_err(|_| RsedisError::Type(format!("CLUSTER SLOTS: invalid port {port}")))?;
    let host = if host.is_empty() || host == "?" {
        origin_host
    } else {
        host
    };
    Ok(NodeDescriptor::new(host, port).addr())
}

/// The cluster's current slot map and how many times it was rebuilt.
pub struct ClusterTopology {
    map: RwLock<Arc<SlotMap>>,
    /// Bumped on every wholesale replacement. MOVED patches do not bump it.
    epoch: AtomicU64,
    seeds: Vec<NodeDescriptor>,
}

impl ClusterTopology {
    pub fn new(seeds: Vec<NodeDescriptor>) -> Self {
        Self {
            map: RwLock::new(Arc::new(SlotMap::empty())),
            epoch: AtomicU64::new(0),
            seeds,
        }
    }

    /// The map routing decisions should use right now.
    pub fn snapshot(&self) -> Arc<SlotMap> {
        self.map.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn seeds(&self) -> &[NodeDescriptor] {
        &self.seeds
    }

    /// Install a freshly discovered map; returns the new epoch.
    pub fn replace(&self, map: SlotMap) -> u64 {
        let mut current = self.map.write();
        *current = Arc::new(map);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a MOVED redirect: `slot` now belongs to `addr`.
    pub fn apply_moved(&self, slot: u16, addr: &str) {
        let mut current = self.map.write();
        if current.master_for_slot(slot) != Some(addr) {
            *current = Arc::new(current.with_slot_moved(slot, addr));
        }
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<String> {
        self.map.read().master_for_slot(slot).map(str::to_owned)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
