use crate::active_transactions::{
    pack_transaction_id, ActiveTransactions, ResponseCallback, TransactionId,
    TRANSACTION_TIMEOUT,
};
use crate::errors::{ErrorKind, Result};
use crate::node::Node;
use crate::response_future::ResponseFuture;
use failure::{Fail, ResultExt};
use krpc_encoding::{Envelope, Message, NodeID, Query, Response};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time;

/// Outbound half of the KRPC transport.
///
/// Allocates transaction ids, injects the `t` and `v` keys, encodes, and
/// sends. Sending is done inline rather than through a queue; UDP sends
/// rarely block.
pub struct SendTransport {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
    transaction_counter: AtomicU32,
    version: Vec<u8>,
}

impl SendTransport {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        transactions: ActiveTransactions,
        version: Vec<u8>,
    ) -> SendTransport {
        SendTransport {
            socket,
            transactions,
            transaction_counter: AtomicU32::new(1),
            version,
        }
    }

    /// Sends `query` and waits for the correlated reply.
    ///
    /// Fails with [`ErrorKind::Timeout`] after ten seconds and with
    /// [`ErrorKind::ErrorResponse`] when the peer answers with an error
    /// envelope.
    pub async fn request(&self, node: Arc<Node>, query: Query) -> Result<Response> {
        let transaction_id = self.send_query(node.clone(), query, None).await?;
        let wait = ResponseFuture::new(transaction_id, self.transactions.clone());
        let envelope = time::timeout(TRANSACTION_TIMEOUT, wait)
            .await
            .map_err(|_| ErrorKind::Timeout { to: node.addr })??;

        match envelope.message {
            Message::Response(response) => Ok(response),
            Message::Error(error) => Err(ErrorKind::ErrorResponse {
                code: error.code,
                message: error.message,
            }
            .into()),
            Message::Query(_) => Err(ErrorKind::UnexpectedResponse { to: node.addr }.into()),
        }
    }

    /// Sends `query` without waiting.
    ///
    /// With a callback, the receive loop runs it when the reply arrives;
    /// without one the caller is expected to await the returned transaction
    /// itself. Either way the transaction is scavenged if no reply shows up
    /// within [`TRANSACTION_TIMEOUT`].
    pub async fn send_query(
        &self,
        node: Arc<Node>,
        query: Query,
        callback: Option<ResponseCallback>,
    ) -> Result<TransactionId> {
        let transaction_id = self.transaction_counter.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            transaction_id: pack_transaction_id(transaction_id),
            version: Some(self.version.clone()),
            message: Message::Query(query),
        };

        self.transactions
            .add_transaction(transaction_id, node.clone(), callback)?;
        node.record_request(transaction_id)?;

        match self
            .socket
            .send_to(&envelope.encode(), SocketAddr::V4(node.addr))
            .await
        {
            Ok(_) => Ok(transaction_id),
            Err(err) => {
                self.transactions.drop_transaction(transaction_id);
                node.forget_transaction(transaction_id);
                Err(err.context(ErrorKind::SendError { to: node.addr }).into())
            }
        }
    }

    /// Sends a reply composed by the inbound-query handler. Replies carry
    /// the querier's transaction id and register nothing locally.
    pub async fn send_response(&self, to: SocketAddrV4, envelope: Envelope) -> Result<()> {
        self.socket
            .send_to(&envelope.encode(), SocketAddr::V4(to))
            .await
            .context(ErrorKind::SendError { to })?;
        Ok(())
    }

    pub async fn ping(&self, id: NodeID, node: Arc<Node>) -> Result<Response> {
        self.request(node, Query::Ping { id }).await
    }

    pub async fn find_node(
        &self,
        id: NodeID,
        node: Arc<Node>,
        target: NodeID,
    ) -> Result<Response> {
        self.request(node, Query::FindNode { id, target }).await
    }

    pub async fn get_peers(
        &self,
        id: NodeID,
        node: Arc<Node>,
        info_hash: NodeID,
    ) -> Result<Response> {
        self.request(node, Query::GetPeers { id, info_hash }).await
    }

    pub async fn announce_peer(
        &self,
        id: NodeID,
        node: Arc<Node>,
        info_hash: NodeID,
        port: u16,
        token: Vec<u8>,
    ) -> Result<Response> {
        self.request(
            node,
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port: false,
            },
        )
        .await
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match self.socket.local_addr().context(ErrorKind::AddrUnavailable)? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(ErrorKind::AddrUnavailable.into()),
        }
    }
}
