use crate::token::TokenMinter;
use futures::future::BoxFuture;
use krpc_encoding::{Envelope, Message, NodeID, NodeInfo, Query, Response};
use log::{debug, warn};
use routing_table::{RoutingTable, K};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use tokio_krpc::{InboundQueryHandler, Node, SendTransport};

/// Default server-side responder for the four BEP-5 queries.
///
/// Every query first refreshes the routing table with its sender, then gets
/// a reply built around this node's id. Custom handlers installed by an
/// embedding program typically do their own processing and then delegate
/// here.
pub struct DhtHandler {
    id: NodeID,
    version: Vec<u8>,
    transport: Arc<SendTransport>,
    table: Arc<Mutex<RoutingTable>>,
    tokens: Arc<Mutex<TokenMinter>>,
}

impl DhtHandler {
    pub(crate) fn new(
        id: NodeID,
        version: Vec<u8>,
        transport: Arc<SendTransport>,
        table: Arc<Mutex<RoutingTable>>,
        tokens: Arc<Mutex<TokenMinter>>,
    ) -> DhtHandler {
        DhtHandler {
            id,
            version,
            transport,
            table,
            tokens,
        }
    }

    async fn respond(&self, query: Query, transaction_id: Vec<u8>, source: SocketAddrV4) {
        debug!("request from {}: {:?}", source, query);

        {
            let mut table = match self.table.lock() {
                Ok(table) => table,
                Err(_) => {
                    warn!("routing table lock poisoned, dropping query");
                    return;
                }
            };
            table.update(query.id(), Arc::new(Node::new(source)));
        }

        let mut response = Response::only_id(self.id.clone());
        match &query {
            Query::Ping { .. } => {}
            Query::FindNode { target, .. } => {
                response.nodes = Some(self.closest_nodes(target));
            }
            Query::GetPeers { id, info_hash } => {
                // The token lets us accept a later announce without keeping
                // any per-info-hash state.
                let token = match self.tokens.lock() {
                    Ok(tokens) => tokens.mint(info_hash, id, source),
                    Err(_) => {
                        warn!("token state lock poisoned, dropping query");
                        return;
                    }
                };
                response.token = Some(token);
                // No announce storage, so the answer is always the closest
                // nodes, never `values`.
                response.nodes = Some(self.closest_nodes(info_hash));
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                token,
                ..
            } => {
                let valid = match self.tokens.lock() {
                    Ok(tokens) => tokens.verify(token, info_hash, id, source),
                    Err(_) => {
                        warn!("token state lock poisoned, dropping query");
                        return;
                    }
                };
                if !valid {
                    debug!("ignoring announce with invalid token from {}", source);
                    return;
                }
                // Valid announce: acknowledged but intentionally not stored.
            }
        }

        let reply = Envelope {
            transaction_id,
            version: Some(self.version.clone()),
            message: Message::Response(response),
        };
        if let Err(err) = self.transport.send_response(source, reply).await {
            warn!("failed to reply to {}: {}", source, err);
        }
    }

    fn closest_nodes(&self, target: &NodeID) -> Vec<NodeInfo> {
        match self.table.lock() {
            Ok(table) => table
                .closest(target, K)
                .into_iter()
                .map(|(id, node)| NodeInfo::new(id, node.addr))
                .collect(),
            Err(_) => {
                warn!("routing table lock poisoned, returning no nodes");
                Vec::new()
            }
        }
    }
}

impl InboundQueryHandler for DhtHandler {
    fn handle_query(&self, query: Envelope, source: SocketAddrV4) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Message::Query(inner) = query.message {
                self.respond(inner, query.transaction_id, source).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::watch;
    use tokio::time;

    struct TestNode {
        id: NodeID,
        addr: SocketAddrV4,
        table: Arc<Mutex<RoutingTable>>,
        _stop: watch::Sender<bool>,
    }

    async fn spawn_node(id: NodeID) -> TestNode {
        let (send, recv, slot) = tokio_krpc::bind(0, b"XX01".to_vec()).await.unwrap();
        let table = Arc::new(Mutex::new(RoutingTable::new(id.clone())));
        let tokens = Arc::new(Mutex::new(TokenMinter::new()));
        slot.set(Arc::new(DhtHandler::new(
            id.clone(),
            b"XX01".to_vec(),
            send.clone(),
            table.clone(),
            tokens,
        )));
        let (stop, stopped) = watch::channel(false);
        tokio::spawn(recv.serve(stopped));

        let port = send.local_addr().unwrap().port();
        TestNode {
            id,
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            table,
            _stop: stop,
        }
    }

    async fn raw_client() -> UdpSocket {
        UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap()
    }

    fn query(transaction_id: &[u8], query: Query) -> Envelope {
        Envelope {
            transaction_id: transaction_id.to_vec(),
            version: None,
            message: Message::Query(query),
        }
    }

    /// Sends a query and waits for the reply bearing the same `t`,
    /// skipping any queries the node may direct at us meanwhile.
    async fn exchange(socket: &UdpSocket, to: SocketAddrV4, envelope: &Envelope) -> Response {
        socket.send_to(&envelope.encode(), to).await.unwrap();
        let deadline = Duration::from_secs(5);
        time::timeout(deadline, async {
            let mut buf = [0u8; 4096];
            loop {
                let (len, _) = socket.recv_from(&mut buf).await.unwrap();
                if let Ok(reply) = Envelope::decode(&buf[..len]) {
                    if reply.transaction_id == envelope.transaction_id {
                        if let Message::Response(response) = reply.message {
                            return response;
                        }
                    }
                }
            }
        })
        .await
        .expect("no reply before deadline")
    }

    async fn assert_silence(socket: &UdpSocket) {
        let mut buf = [0u8; 4096];
        let silent = time::timeout(Duration::from_millis(300), async {
            loop {
                let (len, _) = socket.recv_from(&mut buf).await.unwrap();
                if let Ok(reply) = Envelope::decode(&buf[..len]) {
                    if let Message::Response(_) = reply.message {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(silent.is_err(), "expected no reply");
    }

    #[tokio::test]
    async fn ping_replies_and_updates_the_table() {
        let node = spawn_node(NodeID::new([7; 20])).await;
        let client = raw_client().await;
        let client_id = NodeID::new([1; 20]);

        let response = exchange(&client, node.addr, &query(b"t0", Query::Ping { id: client_id.clone() })).await;

        assert_eq!(response.id, node.id);
        assert!(node.table.lock().unwrap().contains(&client_id));
    }

    #[tokio::test]
    async fn find_node_returns_known_closest_nodes() {
        let node = spawn_node(NodeID::new([7; 20])).await;
        let known = NodeID::new([0xaa; 20]);
        node.table.lock().unwrap().update(
            &known,
            Arc::new(Node::new("10.1.2.3:6881".parse().unwrap())),
        );

        let client = raw_client().await;
        let response = exchange(
            &client,
            node.addr,
            &query(
                b"t1",
                Query::FindNode {
                    id: NodeID::new([2; 20]),
                    target: known.clone(),
                },
            ),
        )
        .await;

        let nodes = response.nodes.expect("find_node reply must carry nodes");
        assert!(nodes.iter().any(|info| info.id == known));
    }

    #[tokio::test]
    async fn announce_is_bound_to_the_get_peers_endpoint() {
        let node = spawn_node(NodeID::new([7; 20])).await;
        let client = raw_client().await;
        let client_id = NodeID::new([3; 20]);
        let info_hash = NodeID::new([0x99; 20]);

        let response = exchange(
            &client,
            node.addr,
            &query(
                b"t2",
                Query::GetPeers {
                    id: client_id.clone(),
                    info_hash: info_hash.clone(),
                },
            ),
        )
        .await;
        // No announce storage: always nodes, never values, plus a token.
        let token = response.token.expect("get_peers reply must carry a token");
        assert!(response.values.is_none());
        assert!(response.nodes.is_some());

        let announce = |token: Vec<u8>| {
            query(
                b"t3",
                Query::AnnouncePeer {
                    id: client_id.clone(),
                    info_hash: info_hash.clone(),
                    port: 7000,
                    token,
                    implied_port: false,
                },
            )
        };

        // Same endpoint: accepted with a bare acknowledgement.
        let ack = exchange(&client, node.addr, &announce(token.clone())).await;
        assert_eq!(ack.id, node.id);
        assert!(ack.nodes.is_none());

        // Same token replayed from another endpoint: silently dropped.
        let imposter = raw_client().await;
        imposter
            .send_to(&announce(token).encode(), node.addr)
            .await
            .unwrap();
        assert_silence(&imposter).await;
    }

    #[tokio::test]
    async fn unknown_methods_get_no_reply() {
        let node = spawn_node(NodeID::new([7; 20])).await;
        let client = raw_client().await;

        let raw = b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:tz1:y1:qe";
        client.send_to(raw, node.addr).await.unwrap();
        assert_silence(&client).await;
    }
}
