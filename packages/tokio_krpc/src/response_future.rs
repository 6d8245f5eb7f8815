use crate::active_transactions::{ActiveTransactions, TransactionId};
use crate::errors::Result;
use krpc_encoding::Envelope;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future which resolves when the response for a transaction appears in
/// the transaction table.
///
/// Dropping the future unregisters the transaction, so an abandoned or
/// timed-out wait cannot leak table entries.
pub(crate) struct ResponseFuture {
    transaction_id: TransactionId,
    transactions: ActiveTransactions,
}

impl ResponseFuture {
    pub(crate) fn new(
        transaction_id: TransactionId,
        transactions: ActiveTransactions,
    ) -> ResponseFuture {
        ResponseFuture {
            transaction_id,
            transactions,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Envelope>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.transactions
            .poll_response(self.transaction_id, cx.waker())
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.transactions.drop_transaction(self.transaction_id);
    }
}
