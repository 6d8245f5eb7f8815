//! KRPC request/response transport over UDP (BEP-5).
//!
//! One socket serves both directions. Outbound queries get a monotonically
//! increasing transaction id and are tracked in a shared table; the receive
//! loop correlates replies back to waiters or callbacks, forwards inbound
//! queries to a replaceable handler, and scavenges transactions that have
//! gone unanswered for ten seconds.

mod active_transactions;
mod errors;
mod handler;
mod node;
mod recv;
mod response_future;
mod send;

pub use crate::active_transactions::{ResponseCallback, TransactionId, TRANSACTION_TIMEOUT};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::handler::{HandlerSlot, InboundQueryHandler};
pub use crate::node::Node;
pub use crate::recv::RecvTransport;
pub use crate::send::SendTransport;

use crate::active_transactions::ActiveTransactions;
use failure::ResultExt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Binds the KRPC socket on `port` and returns the two transport halves
/// plus the handler slot inbound queries are dispatched through.
///
/// The receive half does nothing until [`RecvTransport::serve`] is spawned;
/// callers must have it running before issuing the first request, or the
/// reply will go unread and the request will time out.
pub async fn bind(
    port: u16,
    version: Vec<u8>,
) -> Result<(Arc<SendTransport>, RecvTransport, HandlerSlot)> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .await
        .context(ErrorKind::BindError { port })?;
    let socket = Arc::new(socket);

    let transactions = ActiveTransactions::new();
    let handler = HandlerSlot::default();

    let send = Arc::new(SendTransport::new(
        socket.clone(),
        transactions.clone(),
        version,
    ));
    let recv = RecvTransport::new(socket, transactions, handler.clone());
    Ok((send, recv, handler))
}
