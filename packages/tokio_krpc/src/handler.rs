use futures::future::BoxFuture;
use krpc_encoding::Envelope;
use log::debug;
use std::net::SocketAddrV4;
use std::sync::{Arc, RwLock};

/// Seam between the transport and whatever answers queries.
///
/// The receive loop hands every decoded query envelope (`y == "q"`) to the
/// installed handler together with its source endpoint. Handlers run on the
/// receive loop, so they should stay short; replies go back out through
/// [`crate::SendTransport::send_response`].
pub trait InboundQueryHandler: Send + Sync {
    fn handle_query(&self, query: Envelope, source: SocketAddrV4) -> BoxFuture<'_, ()>;
}

/// Replaceable slot the receive loop reads its handler from, so an embedding
/// program can swap handlers on a running transport.
#[derive(Clone)]
pub struct HandlerSlot {
    inner: Arc<RwLock<Arc<dyn InboundQueryHandler>>>,
}

impl HandlerSlot {
    pub fn new(handler: Arc<dyn InboundQueryHandler>) -> HandlerSlot {
        HandlerSlot {
            inner: Arc::new(RwLock::new(handler)),
        }
    }

    pub fn set(&self, handler: Arc<dyn InboundQueryHandler>) {
        match self.inner.write() {
            Ok(mut slot) => *slot = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn InboundQueryHandler> {
        match self.inner.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for HandlerSlot {
    fn default() -> HandlerSlot {
        HandlerSlot::new(Arc::new(DiscardHandler))
    }
}

/// Installed until the embedding program provides a real responder.
struct DiscardHandler;

impl InboundQueryHandler for DiscardHandler {
    fn handle_query(&self, _query: Envelope, source: SocketAddrV4) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!("no inbound handler installed, dropping query from {}", source);
        })
    }
}
