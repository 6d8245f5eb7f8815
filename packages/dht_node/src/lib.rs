//! A lightweight participating node for the BitTorrent Mainline DHT.
//!
//! The node joins the overlay, keeps a routing table of reachable peers,
//! answers the four BEP-5 queries, and runs iterative lookups on behalf of
//! the embedding program. It takes part in the overlay only: no file data
//! is ever transferred, and announces are validated but never stored.

mod config;
mod dht;
mod errors;
mod handler;
mod token;

pub use crate::config::{DhtConfig, DEFAULT_BOOTSTRAP_ROUTER};
pub use crate::dht::{Dht, DEFAULT_LOOKUP_ATTEMPTS};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::handler::DhtHandler;

// The transport-level seam an embedding program implements to intercept
// inbound queries.
pub use tokio_krpc::InboundQueryHandler;
