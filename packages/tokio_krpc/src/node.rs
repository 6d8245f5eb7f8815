use crate::active_transactions::TransactionId;
use crate::errors::{ErrorKind, Result};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::time::Instant;

/// A remote DHT node as the transport sees it: an endpoint plus liveness
/// bookkeeping.
///
/// Nodes are shared (`Arc<Node>`) between the routing table, which decides
/// membership, and the transport, which stamps them on every send and every
/// correlated reply.
pub struct Node {
    pub addr: SocketAddrV4,
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    last_request: Option<Instant>,
    last_reply: Option<Instant>,
    outstanding: HashSet<TransactionId>,
}

impl Node {
    pub fn new(addr: SocketAddrV4) -> Node {
        Node {
            addr,
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Stamps the request time and tracks the transaction as outstanding.
    pub(crate) fn record_request(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| ErrorKind::LockPoisoned)?;
        state.last_request = Some(Instant::now());
        state.outstanding.insert(transaction_id);
        Ok(())
    }

    /// Stamps the reply time and retires the transaction.
    pub(crate) fn record_reply(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| ErrorKind::LockPoisoned)?;
        state.last_reply = Some(Instant::now());
        state.outstanding.remove(&transaction_id);
        Ok(())
    }

    /// Retires a transaction that expired without a reply.
    pub(crate) fn forget_transaction(&self, transaction_id: TransactionId) {
        if let Ok(mut state) = self.state.lock() {
            state.outstanding.remove(&transaction_id);
        }
    }

    pub fn last_request(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|state| state.last_request)
    }

    pub fn last_reply(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|state| state.last_reply)
    }

    pub fn outstanding_queries(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.outstanding.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.addr)
    }
}
