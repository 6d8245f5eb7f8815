use crate::active_transactions::ActiveTransactions;
use crate::handler::HandlerSlot;
use krpc_encoding::{Envelope, ErrorKind as EncodingErrorKind, Message};
use log::{debug, info, warn};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time;

const RECV_BUFFER_LEN: usize = 4096;

/// The loop wakes at least this often so expired transactions are scavenged
/// even when no traffic arrives.
const IDLE_TICK: Duration = Duration::from_millis(500);

/// Inbound half of the KRPC transport: pulls datagrams off the shared
/// socket, decodes them, and dispatches replies to waiters and queries to
/// the installed handler.
pub struct RecvTransport {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
    handler: HandlerSlot,
}

impl RecvTransport {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        transactions: ActiveTransactions,
        handler: HandlerSlot,
    ) -> RecvTransport {
        RecvTransport {
            socket,
            transactions,
            handler,
        }
    }

    /// Runs the receive loop until `shutdown` flips to true.
    ///
    /// The loop must never die: every per-packet failure is logged and
    /// swallowed.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = time::interval(IDLE_TICK);
        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("krpc receive loop shutting down");
                        return;
                    }
                }
                _ = tick.tick() => {}
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, SocketAddr::V4(from))) => {
                        self.handle_datagram(&buf[..len], from).await;
                    }
                    Ok((_, SocketAddr::V6(from))) => {
                        debug!("dropping datagram from IPv6 source {}", from);
                    }
                    Err(err) => warn!("recv_from failed: {}", err),
                }
            }

            if let Err(err) = self.transactions.scavenge() {
                warn!("transaction scavenge failed: {}", err);
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddrV4) {
        let envelope = match Envelope::decode(datagram) {
            Ok(envelope) => envelope,
            Err(err) => {
                match err.kind() {
                    // Well-formed bencode carrying something we do not
                    // speak is worth a warning; random noise is not.
                    EncodingErrorKind::UnknownMessageKind { .. }
                    | EncodingErrorKind::UnknownMethod { .. } => {
                        warn!("dropping message from {}: {}", from, err)
                    }
                    _ => debug!("dropping undecodable packet from {}: {}", from, err),
                }
                return;
            }
        };

        match envelope.message {
            Message::Query(_) => {
                debug!("query from {}", from);
                self.handler.get().handle_query(envelope, from).await;
            }
            Message::Response(_) | Message::Error(_) => {
                if let Err(err) = self.transactions.handle_response(envelope) {
                    warn!("failed to correlate reply from {}: {}", from, err);
                }
            }
        }
    }
}
