use futures::future::BoxFuture;
use krpc_encoding::{Envelope, Message, NodeID, Query, Response};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_krpc::{bind, ErrorKind, InboundQueryHandler, Node, SendTransport};

/// Answers `ping` with its own id, the smallest useful responder.
struct PingResponder {
    id: NodeID,
    transport: Arc<SendTransport>,
}

impl InboundQueryHandler for PingResponder {
    fn handle_query(&self, query: Envelope, source: SocketAddrV4) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Message::Query(Query::Ping { .. }) = query.message {
                let reply = Envelope {
                    transaction_id: query.transaction_id,
                    version: None,
                    message: Message::Response(Response::only_id(self.id.clone())),
                };
                let _ = self.transport.send_response(source, reply).await;
            }
        })
    }
}

fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[tokio::test]
async fn ping_round_trip_stamps_node_and_clears_transaction() {
    let (server_send, server_recv, server_handler) =
        bind(0, b"XX01".to_vec()).await.unwrap();
    let server_id = NodeID::new([7; 20]);
    server_handler.set(Arc::new(PingResponder {
        id: server_id.clone(),
        transport: server_send.clone(),
    }));
    let (server_stop, server_stopped) = watch::channel(false);
    tokio::spawn(server_recv.serve(server_stopped));

    let (client_send, client_recv, _client_handler) =
        bind(0, b"XX01".to_vec()).await.unwrap();
    let (client_stop, client_stopped) = watch::channel(false);
    tokio::spawn(client_recv.serve(client_stopped));

    let server_addr = loopback(server_send.local_addr().unwrap().port());
    let node = Arc::new(Node::new(server_addr));

    let response = client_send
        .ping(NodeID::new([9; 20]), node.clone())
        .await
        .unwrap();

    assert_eq!(response.id, server_id);
    assert!(node.last_request().is_some());
    assert!(node.last_reply().is_some());
    assert_eq!(node.outstanding_queries(), 0);

    let _ = server_stop.send(true);
    let _ = client_stop.send(true);
}

#[tokio::test(start_paused = true)]
async fn request_to_silent_peer_times_out() {
    let (client_send, _client_recv, _handler) = bind(0, b"XX01".to_vec()).await.unwrap();

    // Bound but never read: the query vanishes into the OS buffer.
    let sink = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
    let sink_addr = match sink.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("expected IPv4 bind, got {}", other),
    };

    let node = Arc::new(Node::new(sink_addr));
    let err = client_send
        .ping(NodeID::new([9; 20]), node.clone())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::Timeout { to: sink_addr });
    assert!(node.last_reply().is_none());
}
