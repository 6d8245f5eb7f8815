//! Wire types for the BitTorrent Mainline DHT (BEP-5).
//!
//! Everything a node puts on the wire is a bencoded dictionary; this crate
//! provides the canonical codec ([`Value`]), the 160-bit identifier type
//! ([`NodeID`]), compact node/peer encodings ([`NodeInfo`]), and the typed
//! KRPC message envelope ([`Envelope`]).

mod errors;
mod messages;
mod node_id;
mod node_info;
mod value;

pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::messages::{Envelope, KrpcError, Message, Query, Response};
pub use crate::node_id::NodeID;
pub use crate::node_info::{
    decode_peer, encode_peer, NodeInfo, COMPACT_NODE_LEN, COMPACT_PEER_LEN,
};
pub use crate::value::Value;
