use crate::errors::{ErrorKind, Result};
use num_bigint::BigUint;
use rand::Rng;
use std::fmt;

/// A 160-bit DHT node identifier.
///
/// Torrent info-hashes share the same key space, so lookups take a `NodeID`
/// whether the target is a node or a torrent.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeID([u8; 20]);

impl NodeID {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> NodeID {
        NodeID(bytes)
    }

    /// A uniformly random identifier.
    pub fn random() -> NodeID {
        NodeID(rand::thread_rng().gen())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<NodeID> {
        if bytes.len() != Self::LEN {
            return Err(ErrorKind::InvalidNodeIdLength { len: bytes.len() }.into());
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(NodeID(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The id as a 160-bit unsigned integer, most significant byte first.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// XOR distance to `other`; smaller means closer.
    pub fn distance_to(&self, other: &NodeID) -> BigUint {
        let mut xored = [0u8; 20];
        for (i, byte) in xored.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        BigUint::from_bytes_be(&xored)
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self)
    }
}

impl From<[u8; 20]> for NodeID {
    fn from(bytes: [u8; 20]) -> NodeID {
        NodeID(bytes)
    }
}
