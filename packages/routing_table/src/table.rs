use crate::bucket::Bucket;
use crate::K;
use krpc_encoding::NodeID;
use log::debug;
use num_bigint::BigUint;
use rand::Rng;
use std::cmp;
use std::sync::Arc;
use tokio_krpc::Node;

/// Prefix routing table.
///
/// Buckets tile the whole 160-bit key space, but only the bucket containing
/// the table's own id may be split when it fills up. That concentrates
/// resolution near self, where lookups converge, and keeps the table
/// bounded everywhere else.
pub struct RoutingTable {
    /// Node identifier the table is based around. There will be more
    /// buckets closer to this identifier.
    id: NodeID,
    id_value: BigUint,

    /// Ordered list of buckets covering the key space. The first bucket
    /// starts at key 0 and the last bucket ends at key 2^160.
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(id: NodeID) -> RoutingTable {
        let id_value = id.to_biguint();
        RoutingTable {
            id,
            id_value,
            buckets: vec![Bucket::initial_bucket()],
        }
    }

    /// Folds an observed node into the table.
    ///
    /// A known id has its liveness refreshed (and any blacklist flag
    /// cleared). A new id is inserted if its bucket has room; a full bucket
    /// covering our own id is split and the insertion retried; otherwise a
    /// blacklisted entry is evicted to make room, or the candidate is
    /// discarded.
    pub fn update(&mut self, id: &NodeID, node: Arc<Node>) {
        if *id == self.id {
            return;
        }
        let value = id.to_biguint();

        loop {
            let idx = self.bucket_idx(&value);
            let bucket = &mut self.buckets[idx];

            if let Some(entry) = bucket.get_mut(id) {
                entry.refresh(node);
                return;
            }
            if !bucket.is_full() {
                bucket.add(id.clone(), node);
                return;
            }
            if bucket.could_hold(&self.id_value) {
                self.split_bucket(idx);
                continue;
            }
            if bucket.evict_bad() {
                bucket.add(id.clone(), node);
                return;
            }
            debug!("discarding candidate {}, bucket full", id);
            return;
        }
    }

    /// Blacklists a node after a timed-out query. Blacklisted nodes are
    /// skipped by [`closest`](RoutingTable::closest) and are the preferred
    /// eviction victims.
    pub fn mark_bad(&mut self, id: &NodeID) {
        let value = id.to_biguint();
        let idx = self.bucket_idx(&value);
        if let Some(entry) = self.buckets[idx].get_mut(id) {
            debug!("blacklisting {}, last seen {}", id, entry.last_seen);
            entry.bad = true;
        }
    }

    /// Whether `id` occupies a slot, blacklisted or not.
    pub fn contains(&self, id: &NodeID) -> bool {
        let value = id.to_biguint();
        self.buckets
            .iter()
            .find(|bucket| bucket.could_hold(&value))
            .map_or(false, |bucket| {
                bucket.all_nodes().any(|entry| entry.id == *id)
            })
    }

    /// Up to `k` reachable nodes, ordered by ascending XOR distance to
    /// `target`.
    pub fn closest(&self, target: &NodeID, k: usize) -> Vec<(NodeID, Arc<Node>)> {
        let mut candidates: Vec<(BigUint, NodeID, Arc<Node>)> = self
            .buckets
            .iter()
            .flat_map(Bucket::good_nodes)
            .map(|entry| {
                (
                    entry.id.distance_to(target),
                    entry.id.clone(),
                    entry.node.clone(),
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.truncate(k);
        candidates
            .into_iter()
            .map(|(_, id, node)| (id, node))
            .collect()
    }

    /// A pseudo-random scattering of reachable nodes, used by maintenance
    /// probing. Each round draws up to `k` nodes from randomly picked
    /// buckets; duplicates are dropped, so fewer may come back.
    pub fn sample(&self, k: usize, rounds: usize) -> Vec<(NodeID, Arc<Node>)> {
        let mut rng = rand::thread_rng();
        let mut picked: Vec<(NodeID, Arc<Node>)> = Vec::new();
        for _ in 0..rounds {
            for _ in 0..k {
                let bucket = &self.buckets[rng.gen_range(0..self.buckets.len())];
                if let Some(entry) = bucket.random_good(&mut rng) {
                    if !picked.iter().any(|(id, _)| id == &entry.id) {
                        picked.push((entry.id.clone(), entry.node.clone()));
                    }
                }
            }
        }
        picked
    }

    /// Total tracked nodes, blacklisted ones included.
    pub fn count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Gets the index of the bucket covering `value`.
    fn bucket_idx(&self, value: &BigUint) -> usize {
        self.buckets
            .binary_search_by(|bucket| {
                if bucket.could_hold(value) {
                    cmp::Ordering::Equal
                } else {
                    bucket.start.cmp(value)
                }
            })
            .expect("no bucket covers id")
    }

    /// Splits the bucket at `idx` into two buckets.
    fn split_bucket(&mut self, idx: usize) {
        let next_bucket = self.buckets[idx].split();
        self.buckets.insert(idx + 1, next_bucket);
    }
}
