//! Peer membership for the DHT: prefix buckets over the 160-bit key space,
//! with fine resolution near the table's own id and at most [`K`] nodes
//! per bucket everywhere else.

mod bucket;
mod table;

pub use crate::table::RoutingTable;

/// Bucket capacity, BEP-5's K.
pub const K: usize = 8;
