use krpc_encoding::NodeID;
use std::time::Duration;

/// The well-known BitTorrent bootstrap router.
pub const DEFAULT_BOOTSTRAP_ROUTER: &str = "router.bittorrent.com:6881";

/// Behaviour knobs for a [`crate::Dht`] node.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// UDP port to bind; 0 lets the OS pick.
    pub port: u16,

    /// This node's identifier.
    pub id: NodeID,

    /// Client version tag injected into every outbound message (`v` key).
    pub version: Vec<u8>,

    /// `host:port` pairs pinged at startup to seed the routing table.
    pub bootstrap: Vec<String>,

    /// Whether the maintenance loop actively walks unfamiliar regions of
    /// the key space between self-lookups.
    pub active_discovery: bool,

    /// Pause between self-lookups. With active discovery on, the effective
    /// pause shrinks to `self_find_delay / (active_discoveries + 1)`.
    pub self_find_delay: Duration,

    /// Discovery steps per cleanup step.
    pub active_discoveries: u32,
}

impl DhtConfig {
    pub fn new(port: u16, id: NodeID, version: Vec<u8>) -> DhtConfig {
        DhtConfig {
            port,
            id,
            version,
            bootstrap: vec![DEFAULT_BOOTSTRAP_ROUTER.to_string()],
            active_discovery: true,
            self_find_delay: Duration::from_secs(180),
            active_discoveries: 10,
        }
    }
}
