use crate::K;
use chrono::{DateTime, Utc};
use krpc_encoding::NodeID;
use num_bigint::BigUint;
use rand::Rng;
use std::sync::Arc;
use tokio_krpc::Node;

/// One tracked peer: its id, the shared transport record, and table-side
/// liveness state.
pub(crate) struct NodeEntry {
    pub(crate) id: NodeID,
    pub(crate) node: Arc<Node>,
    pub(crate) last_seen: DateTime<Utc>,
    pub(crate) bad: bool,
}

impl NodeEntry {
    fn new(id: NodeID, node: Arc<Node>) -> NodeEntry {
        NodeEntry {
            id,
            node,
            last_seen: Utc::now(),
            bad: false,
        }
    }

    /// A fresh successful contact reinstates even a blacklisted node.
    pub(crate) fn refresh(&mut self, node: Arc<Node>) {
        self.node = node;
        self.last_seen = Utc::now();
        self.bad = false;
    }
}

/// A contiguous id range holding up to [`K`] node entries.
///
/// Buckets tile the key space: `start` is inclusive, `end` exclusive.
pub(crate) struct Bucket {
    pub(crate) start: BigUint,
    pub(crate) end: BigUint,
    nodes: Vec<NodeEntry>,
}

impl Bucket {
    /// The single bucket covering the entire 160-bit key space.
    pub(crate) fn initial_bucket() -> Bucket {
        Bucket {
            start: BigUint::from(0u8),
            end: BigUint::from(1u8) << 160,
            nodes: Vec::with_capacity(K),
        }
    }

    pub(crate) fn could_hold(&self, value: &BigUint) -> bool {
        *value >= self.start && *value < self.end
    }

    pub(crate) fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn get_mut(&mut self, id: &NodeID) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|entry| entry.id == *id)
    }

    /// Caller must ensure the bucket is not full.
    pub(crate) fn add(&mut self, id: NodeID, node: Arc<Node>) {
        self.nodes.push(NodeEntry::new(id, node));
    }

    /// Evicts one blacklisted entry, making room for a fresh candidate.
    pub(crate) fn evict_bad(&mut self) -> bool {
        match self.nodes.iter().position(|entry| entry.bad) {
            Some(index) => {
                self.nodes.remove(index);
                true
            }
            None => false,
        }
    }

    /// Splits off the upper half of this bucket's range, redistributing
    /// entries between the two halves.
    pub(crate) fn split(&mut self) -> Bucket {
        let mid = (&self.start + &self.end) >> 1;
        let (lower, upper): (Vec<NodeEntry>, Vec<NodeEntry>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|entry| entry.id.to_biguint() < mid);
        self.nodes = lower;

        Bucket {
            start: mid.clone(),
            end: std::mem::replace(&mut self.end, mid),
            nodes: upper,
        }
    }

    /// Entries that still count as reachable.
    pub(crate) fn good_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter().filter(|entry| !entry.bad)
    }

    /// Every entry, blacklisted ones included.
    pub(crate) fn all_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter()
    }

    pub(crate) fn random_good(&self, rng: &mut impl Rng) -> Option<&NodeEntry> {
        let good: Vec<&NodeEntry> = self.good_nodes().collect();
        if good.is_empty() {
            return None;
        }
        Some(good[rng.gen_range(0..good.len())])
    }
}
