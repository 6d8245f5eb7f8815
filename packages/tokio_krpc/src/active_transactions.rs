use crate::errors::{ErrorKind, Result};
use crate::node::Node;
use byteorder::{ByteOrder, LittleEndian};
use krpc_encoding::{Envelope, Message};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// Transaction identifier: a monotonically increasing counter packed
/// little-endian into the 4-byte `t` field of outbound queries.
pub type TransactionId = u32;

/// Invoked on the receive loop when the reply for a fire-and-forget query
/// arrives.
pub type ResponseCallback = Box<dyn FnOnce(Envelope, Arc<Node>) + Send>;

/// How long a query may stay unanswered before its transaction is scrapped
/// and the waiter observes a timeout.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) enum TxState {
    AwaitingResponse {
        node: Arc<Node>,
        callback: Option<ResponseCallback>,
        task: Option<Waker>,
        sent_at: Instant,
    },
    GotResponse {
        response: Envelope,
    },
}

/// Collection of in-flight transactions awaiting a response.
///
/// Shared between callers, which register transactions, and the receive
/// loop, which resolves or scavenges them.
#[derive(Clone)]
pub(crate) struct ActiveTransactions {
    transactions: Arc<Mutex<HashMap<TransactionId, TxState>>>,
}

impl ActiveTransactions {
    pub(crate) fn new() -> ActiveTransactions {
        ActiveTransactions {
            transactions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn add_transaction(
        &self,
        transaction_id: TransactionId,
        node: Arc<Node>,
        callback: Option<ResponseCallback>,
    ) -> Result<()> {
        self.add_transaction_at(transaction_id, node, callback, Instant::now())
    }

    fn add_transaction_at(
        &self,
        transaction_id: TransactionId,
        node: Arc<Node>,
        callback: Option<ResponseCallback>,
        sent_at: Instant,
    ) -> Result<()> {
        let mut transactions = self.lock()?;
        transactions.insert(
            transaction_id,
            TxState::AwaitingResponse {
                node,
                callback,
                task: None,
                sent_at,
            },
        );
        Ok(())
    }

    /// Correlates an inbound reply or error envelope with its transaction.
    ///
    /// Matched transactions are resolved exactly once: the node is stamped,
    /// the callback runs or the result is parked for the waiter, and any
    /// later reply with the same `t` is discarded. Unmatched replies are
    /// dropped.
    pub(crate) fn handle_response(&self, envelope: Envelope) -> Result<()> {
        let transaction_id = match parse_transaction_id(&envelope.transaction_id) {
            Some(transaction_id) => transaction_id,
            None => {
                if let Message::Error(error) = &envelope.message {
                    warn!("peer reported error without usable transaction id: {}", error);
                } else {
                    debug!("dropping reply with unusable transaction id");
                }
                return Ok(());
            }
        };

        let entry = self.lock()?.remove(&transaction_id);
        match entry {
            None => {
                debug!("dropping reply for unknown transaction {}", transaction_id);
            }
            Some(TxState::AwaitingResponse {
                node,
                callback,
                task,
                ..
            }) => {
                node.record_reply(transaction_id)?;
                match callback {
                    // Callback path: the transaction is finished here, on the
                    // receive loop.
                    Some(callback) => callback(envelope, node),
                    // Waiter path: park the result and wake the waiter.
                    None => {
                        self.lock()?.insert(
                            transaction_id,
                            TxState::GotResponse { response: envelope },
                        );
                        if let Some(waker) = task {
                            waker.wake();
                        }
                    }
                }
            }
            Some(parked @ TxState::GotResponse { .. }) => {
                debug!(
                    "dropping duplicate reply for transaction {}",
                    transaction_id
                );
                self.lock()?.insert(transaction_id, parked);
            }
        }
        Ok(())
    }

    /// Polled by [`crate::response_future::ResponseFuture`].
    ///
    /// A missing transaction stays `Pending`: it was scavenged or consumed,
    /// and the waiter concludes timeout when its own deadline elapses.
    pub(crate) fn poll_response(
        &self,
        transaction_id: TransactionId,
        waker: &Waker,
    ) -> Poll<Result<Envelope>> {
        let mut transactions = match self.lock() {
            Ok(transactions) => transactions,
            Err(err) => return Poll::Ready(Err(err)),
        };

        match transactions.remove(&transaction_id) {
            None => Poll::Pending,
            Some(TxState::AwaitingResponse {
                node,
                callback,
                sent_at,
                ..
            }) => {
                transactions.insert(
                    transaction_id,
                    TxState::AwaitingResponse {
                        node,
                        callback,
                        task: Some(waker.clone()),
                        sent_at,
                    },
                );
                Poll::Pending
            }
            Some(TxState::GotResponse { response }) => Poll::Ready(Ok(response)),
        }
    }

    /// Removes a transaction without resolving it. Used when a waiter gives
    /// up or a send fails after registration.
    pub(crate) fn drop_transaction(&self, transaction_id: TransactionId) {
        if let Ok(mut transactions) = self.transactions.lock() {
            transactions.remove(&transaction_id);
        }
    }

    /// Deletes transactions that have waited longer than
    /// [`TRANSACTION_TIMEOUT`]. Run on every receive-loop iteration.
    pub(crate) fn scavenge(&self) -> Result<()> {
        self.scavenge_at(Instant::now())
    }

    fn scavenge_at(&self, now: Instant) -> Result<()> {
        let mut transactions = self.lock()?;
        let expired: Vec<TransactionId> = transactions
            .iter()
            .filter_map(|(transaction_id, state)| match state {
                TxState::AwaitingResponse { sent_at, .. }
                    if now.duration_since(*sent_at) > TRANSACTION_TIMEOUT =>
                {
                    Some(*transaction_id)
                }
                _ => None,
            })
            .collect();

        for transaction_id in expired {
            if let Some(TxState::AwaitingResponse { node, .. }) =
                transactions.remove(&transaction_id)
            {
                debug!("scavenging expired transaction {}", transaction_id);
                node.forget_transaction(transaction_id);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.transactions.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<TransactionId, TxState>>> {
        self.transactions
            .lock()
            .map_err(|_| ErrorKind::LockPoisoned.into())
    }
}

/// Reads a 4-byte little-endian transaction id, the only shape this
/// transport ever allocates.
pub(crate) fn parse_transaction_id(bytes: &[u8]) -> Option<TransactionId> {
    if bytes.len() != 4 {
        return None;
    }
    Some(LittleEndian::read_u32(bytes))
}

/// Packs a transaction id into its 4-byte wire form.
pub(crate) fn pack_transaction_id(transaction_id: TransactionId) -> Vec<u8> {
    let mut packed = vec![0u8; 4];
    LittleEndian::write_u32(&mut packed, transaction_id);
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response_future::ResponseFuture;
    use krpc_encoding::{KrpcError, NodeID, Response};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn reply(transaction_id: TransactionId) -> Envelope {
        Envelope {
            transaction_id: pack_transaction_id(transaction_id),
            version: None,
            message: Message::Response(Response::only_id(NodeID::new([1; 20]))),
        }
    }

    fn node() -> Arc<Node> {
        Arc::new(Node::new("127.0.0.1:6881".parse().unwrap()))
    }

    #[tokio::test]
    async fn reply_resolves_waiter_and_stamps_node() {
        let transactions = ActiveTransactions::new();
        let node = node();
        transactions.add_transaction(7, node.clone(), None).unwrap();
        node.record_request(7).unwrap();
        assert_eq!(node.outstanding_queries(), 1);

        transactions.handle_response(reply(7)).unwrap();

        let envelope = ResponseFuture::new(7, transactions.clone()).await.unwrap();
        assert_eq!(envelope.transaction_id, pack_transaction_id(7));
        assert!(node.last_reply().is_some());
        assert_eq!(node.outstanding_queries(), 0);
        // Consumed by the waiter.
        assert_eq!(transactions.pending_count(), 0);
    }

    #[tokio::test]
    async fn callback_runs_on_reply() {
        let transactions = ActiveTransactions::new();
        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();
        transactions
            .add_transaction(
                3,
                node(),
                Some(Box::new(move |_envelope, _node| {
                    observed.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();

        transactions.handle_response(reply(3)).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(transactions.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_replies_are_dropped() {
        let transactions = ActiveTransactions::new();
        // Unknown transaction: nothing to resolve, nothing inserted.
        transactions.handle_response(reply(99)).unwrap();
        assert_eq!(transactions.pending_count(), 0);

        transactions.add_transaction(4, node(), None).unwrap();
        transactions.handle_response(reply(4)).unwrap();
        // The duplicate must not clobber the parked response.
        let mut duplicate = reply(4);
        duplicate.message = Message::Error(KrpcError {
            code: 201,
            message: "late duplicate".to_string(),
        });
        transactions.handle_response(duplicate).unwrap();

        let envelope = ResponseFuture::new(4, transactions.clone()).await.unwrap();
        assert!(matches!(envelope.message, Message::Response(_)));
    }

    #[tokio::test]
    async fn scavenge_expires_old_transactions_only() {
        let transactions = ActiveTransactions::new();
        let stale_node = node();
        let sent_at = Instant::now() - (TRANSACTION_TIMEOUT + Duration::from_secs(1));
        transactions
            .add_transaction_at(1, stale_node.clone(), None, sent_at)
            .unwrap();
        stale_node.record_request(1).unwrap();
        transactions.add_transaction(2, node(), None).unwrap();

        transactions.scavenge().unwrap();
        assert_eq!(transactions.pending_count(), 1);
        assert_eq!(stale_node.outstanding_queries(), 0);

        // A late reply for the scavenged transaction is discarded.
        transactions.handle_response(reply(1)).unwrap();
        assert!(stale_node.last_reply().is_none());
    }

    #[tokio::test]
    async fn dropping_the_future_removes_the_transaction() {
        let transactions = ActiveTransactions::new();
        transactions.add_transaction(5, node(), None).unwrap();
        drop(ResponseFuture::new(5, transactions.clone()));
        assert_eq!(transactions.pending_count(), 0);
    }

    #[test]
    fn transaction_id_packing_round_trips() {
        assert_eq!(parse_transaction_id(&pack_transaction_id(0xdead_beef)), Some(0xdead_beef));
        assert_eq!(parse_transaction_id(b"abc"), None);
        assert_eq!(pack_transaction_id(1), vec![1, 0, 0, 0]);
    }
}
