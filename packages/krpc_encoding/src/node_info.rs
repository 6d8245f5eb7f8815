use crate::errors::{ErrorKind, Result};
use crate::node_id::NodeID;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of one record inside a compact `nodes` blob: 20-byte id, 4-byte
/// IPv4 address, 2-byte port, all big-endian.
pub const COMPACT_NODE_LEN: usize = 26;

/// Length of one compact peer endpoint inside a `values` list.
pub const COMPACT_PEER_LEN: usize = 6;

/// Contact information for one DHT node as carried in `nodes` fields.
#[derive(Clone, Eq, PartialEq)]
pub struct NodeInfo {
    pub id: NodeID,
    pub addr: SocketAddrV4,
}

impl NodeInfo {
    pub fn new(id: NodeID, addr: SocketAddrV4) -> NodeInfo {
        NodeInfo { id, addr }
    }

    /// Decodes a compact `nodes` blob into its 26-byte records.
    ///
    /// The whole field is rejected when its length is not a multiple of 26.
    pub fn decode_list(bytes: &[u8]) -> Result<Vec<NodeInfo>> {
        if bytes.len() % COMPACT_NODE_LEN != 0 {
            return Err(ErrorKind::InvalidCompactNodes { len: bytes.len() }.into());
        }
        bytes
            .chunks_exact(COMPACT_NODE_LEN)
            .map(|record| {
                let id = NodeID::from_slice(&record[..20])?;
                let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
                let port = BigEndian::read_u16(&record[24..26]);
                Ok(NodeInfo::new(id, SocketAddrV4::new(ip, port)))
            })
            .collect()
    }

    /// Encodes records into a compact `nodes` blob.
    pub fn encode_list(nodes: &[NodeInfo]) -> Vec<u8> {
        let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
        for node in nodes {
            out.extend_from_slice(node.id.as_bytes());
            out.extend_from_slice(&node.addr.ip().octets());
            let mut port = [0u8; 2];
            BigEndian::write_u16(&mut port, node.addr.port());
            out.extend_from_slice(&port);
        }
        out
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Decodes one compact peer endpoint (`values` entry).
pub fn decode_peer(bytes: &[u8]) -> Result<SocketAddrV4> {
    if bytes.len() != COMPACT_PEER_LEN {
        return Err(ErrorKind::InvalidCompactPeer { len: bytes.len() }.into());
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    Ok(SocketAddrV4::new(ip, BigEndian::read_u16(&bytes[4..6])))
}

/// Encodes one endpoint into the 6-byte compact peer form.
pub fn encode_peer(addr: &SocketAddrV4) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&addr.ip().octets());
    BigEndian::write_u16(&mut out[4..], addr.port());
    out
}
