use crate::config::DhtConfig;
use crate::errors::{ErrorKind, Result};
use crate::handler::DhtHandler;
use crate::token::TokenMinter;
use krpc_encoding::{NodeID, NodeInfo};
use log::{debug, error, info, warn};
use routing_table::{RoutingTable, K};
use sha1::{Digest, Sha1};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_krpc::{
    ErrorKind as TransportErrorKind, HandlerSlot, InboundQueryHandler, Node, RecvTransport,
    SendTransport,
};

/// Default number of successful RPCs an iterative lookup spends before
/// giving up.
pub const DEFAULT_LOOKUP_ATTEMPTS: usize = 10;

const SELF_FIND_RETRY: Duration = Duration::from_secs(1);

const DISCOVERY_SALT: &[u8] = b"discovery walk 4f21c09b";

/// A participating Mainline DHT node.
///
/// [`start`](Dht::start) brings up the receive loop, seeds the routing
/// table from the bootstrap routers, and launches background maintenance.
/// Dropping the node signals both loops to exit; [`shutdown`](Dht::shutdown)
/// does the same but waits for them.
pub struct Dht {
    inner: Arc<DhtInner>,
    responder: Arc<DhtHandler>,
    handler_slot: HandlerSlot,
    recv: Mutex<Option<RecvTransport>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct DhtInner {
    config: DhtConfig,
    transport: Arc<SendTransport>,
    table: Arc<Mutex<RoutingTable>>,
    tokens: Arc<Mutex<TokenMinter>>,
}

#[derive(Clone, Copy)]
enum LookupKind {
    FindNode,
    GetPeers,
}

impl Dht {
    /// Binds the UDP socket and wires up the default responder. Nothing
    /// runs until [`start`](Dht::start).
    pub async fn new(config: DhtConfig) -> Result<Dht> {
        let (transport, recv, handler_slot) =
            tokio_krpc::bind(config.port, config.version.clone()).await?;

        let table = Arc::new(Mutex::new(RoutingTable::new(config.id.clone())));
        let tokens = Arc::new(Mutex::new(TokenMinter::new()));
        let responder = Arc::new(DhtHandler::new(
            config.id.clone(),
            config.version.clone(),
            transport.clone(),
            table.clone(),
            tokens.clone(),
        ));
        handler_slot.set(responder.clone());

        let (shutdown, _) = watch::channel(false);
        Ok(Dht {
            inner: Arc::new(DhtInner {
                config,
                transport,
                table,
                tokens,
            }),
            responder,
            handler_slot,
            recv: Mutex::new(Some(recv)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the inbound-query handler. A custom handler usually does
    /// its own processing and then delegates to
    /// [`default_handler`](Dht::default_handler).
    pub fn set_handler(&self, handler: Arc<dyn InboundQueryHandler>) {
        self.handler_slot.set(handler);
    }

    pub fn default_handler(&self) -> Arc<DhtHandler> {
        self.responder.clone()
    }

    pub fn id(&self) -> &NodeID {
        &self.inner.config.id
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Total nodes currently tracked by the routing table.
    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    /// Starts the node: receive loop first, then bootstrap, then the
    /// maintenance loop.
    pub async fn start(&self) -> Result<()> {
        let recv = self
            .recv
            .lock()
            .map_err(|_| ErrorKind::LockPoisoned)?
            .take()
            .ok_or(ErrorKind::AlreadyStarted)?;

        // The receive path must be live before the first bootstrap ping,
        // or the reply would go unread and the ping would time out.
        let receive_task = tokio::spawn(recv.serve(self.shutdown.subscribe()));
        self.inner.bootstrap().await;
        let maintenance_task = tokio::spawn(run_maintenance(
            self.inner.clone(),
            self.shutdown.subscribe(),
        ));

        self.tasks
            .lock()
            .map_err(|_| ErrorKind::LockPoisoned)?
            .extend(vec![receive_task, maintenance_task]);
        Ok(())
    }

    /// Signals both loops to exit and waits for them. In-flight
    /// synchronous queries observe the shutdown as a timeout.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Iteratively walks toward `target`, folding every `nodes` reply into
    /// the routing table. There is no explicit result; the table itself is
    /// the product.
    pub async fn find_node(&self, target: &NodeID, attempts: usize) -> Result<()> {
        debug!("tracing to {}", target);
        self.inner
            .recurse(target, LookupKind::FindNode, attempts)
            .await
            .map(|_| ())
    }

    /// Iteratively queries for peers of `info_hash`, returning the first
    /// `values` reply encountered.
    pub async fn get_peers(
        &self,
        info_hash: &NodeID,
        attempts: usize,
    ) -> Result<Vec<SocketAddrV4>> {
        debug!("finding peers for {}", info_hash);
        match self
            .inner
            .recurse(info_hash, LookupKind::GetPeers, attempts)
            .await?
        {
            Some(peers) => Ok(peers),
            None => Err(ErrorKind::NotFound.into()),
        }
    }
}

impl DhtInner {
    fn table(&self) -> Result<MutexGuard<'_, RoutingTable>> {
        self.table.lock().map_err(|_| ErrorKind::LockPoisoned.into())
    }

    fn node_count(&self) -> usize {
        self.table.lock().map(|table| table.count()).unwrap_or(0)
    }

    /// Pings every IPv4 address each bootstrap router resolves to and seeds
    /// the table with whoever answers.
    async fn bootstrap(&self) {
        for router in &self.config.bootstrap {
            let addrs = match lookup_host(router.as_str()).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    warn!("failed to resolve bootstrap router {}: {}", router, err);
                    continue;
                }
            };
            for addr in addrs {
                let addr = match addr {
                    SocketAddr::V4(addr) => addr,
                    SocketAddr::V6(_) => continue,
                };
                let node = Arc::new(Node::new(addr));
                // The ping goes out under a throwaway id; the reply tells
                // us who actually answered.
                match self.transport.ping(NodeID::random(), node.clone()).await {
                    Ok(response) => {
                        info!("bootstrap node {} answered as {}", addr, response.id);
                        if let Ok(mut table) = self.table.lock() {
                            table.update(&response.id, node);
                        }
                    }
                    Err(err) => warn!("bootstrap ping to {} failed: {}", addr, err),
                }
            }
        }
        if self.node_count() == 0 {
            warn!("no bootstrap node answered, relying on inbound traffic");
        }
    }

    /// The workhorse behind `find_node` and `get_peers`: query the closest
    /// known nodes, follow their `nodes` replies, stop early on a `values`
    /// hit.
    ///
    /// Only successful RPCs count against `max_attempts`. Timed-out nodes
    /// are blacklisted unless the table is too sparse to afford losing
    /// them; error replies are logged and skipped.
    async fn recurse(
        &self,
        target: &NodeID,
        kind: LookupKind,
        max_attempts: usize,
    ) -> Result<Option<Vec<SocketAddrV4>>> {
        let mut attempts = 0;
        while attempts < max_attempts {
            let close_nodes = self.table()?.closest(target, K);
            if close_nodes.is_empty() {
                return Err(ErrorKind::NotFound.into());
            }

            for (id, node) in close_nodes {
                let outcome = match kind {
                    LookupKind::FindNode => {
                        self.transport
                            .find_node(self.config.id.clone(), node.clone(), target.clone())
                            .await
                    }
                    LookupKind::GetPeers => {
                        self.transport
                            .get_peers(self.config.id.clone(), node.clone(), target.clone())
                            .await
                    }
                };

                match outcome {
                    Ok(response) => {
                        attempts += 1;
                        if let LookupKind::GetPeers = kind {
                            if let Some(peers) = response.values {
                                return Ok(Some(peers));
                            }
                        }
                        if let Some(nodes) = response.nodes {
                            self.ingest(nodes)?;
                        }
                    }
                    Err(err) => match err.kind() {
                        TransportErrorKind::Timeout { .. } => {
                            let mut table = self.table()?;
                            if table.count() > K {
                                warn!("node timed out, blacklisting {}", node.addr);
                                table.mark_bad(&id);
                            } else {
                                warn!(
                                    "node {} timed out, keeping it while the table is sparse",
                                    node.addr
                                );
                            }
                        }
                        TransportErrorKind::ErrorResponse { .. } => {
                            error!("peer {} answered with an error: {}", node.addr, err);
                        }
                        _ => warn!("query to {} failed: {}", node.addr, err),
                    },
                }
            }
        }

        match kind {
            // The caller expected a result key and never saw one.
            LookupKind::GetPeers => Err(ErrorKind::NotFound.into()),
            LookupKind::FindNode => Ok(None),
        }
    }

    fn ingest(&self, nodes: Vec<NodeInfo>) -> Result<()> {
        let mut table = self.table()?;
        for info in nodes {
            table.update(&info.id, Arc::new(Node::new(info.addr)));
        }
        Ok(())
    }
}

/// Background connectivity upkeep.
///
/// The very first thing this does is look up our own id, which links us to
/// our neighbourhood and makes our answers to inbound queries useful.
/// Afterwards it alternates between walking unfamiliar key-space regions
/// (active discovery) and probing a random sample of known nodes, tossing
/// the ones that no longer answer.
async fn run_maintenance(inner: Arc<DhtInner>, mut shutdown: watch::Receiver<bool>) {
    info!("establishing connections to the overlay");
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            result = inner.recurse(
                &inner.config.id,
                LookupKind::FindNode,
                DEFAULT_LOOKUP_ATTEMPTS,
            ) => match result {
                Ok(_) => break,
                Err(err) => {
                    error!("initial self lookup failed: {}", err);
                    time::sleep(SELF_FIND_RETRY).await;
                }
            }
        }
    }

    let mut delay = inner.config.self_find_delay;
    if inner.config.active_discovery {
        delay /= inner.config.active_discoveries + 1;
    }
    info!(
        "connected to the overlay, maintenance every {:?}, routing table contains {} nodes",
        delay,
        inner.node_count()
    );

    let mut iteration: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = time::sleep(delay) => {}
        }
        iteration += 1;

        if let Ok(mut tokens) = inner.tokens.lock() {
            if tokens.rotate_if_due() {
                debug!("rotated announce token secret");
            }
        }

        let active = inner.config.active_discovery
            && iteration % u64::from(inner.config.active_discoveries + 1) != 0;
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = maintenance_step(&inner, active, iteration) => {}
        }
    }
}

async fn maintenance_step(inner: &DhtInner, active: bool, iteration: u64) {
    if active {
        // Walk a deterministic but unpredictable region of the key space.
        let target = discovery_target(&inner.config.id, iteration);
        if let Err(err) = inner
            .recurse(&target, LookupKind::FindNode, DEFAULT_LOOKUP_ATTEMPTS)
            .await
        {
            warn!("discovery lookup failed: {}", err);
        }
        info!(
            "tracing done, routing table contains {} nodes",
            inner.node_count()
        );
    } else {
        // Probe a random sample of known nodes and toss the silent ones.
        let probes = match inner.table() {
            Ok(table) => table.sample(10, 1),
            Err(_) => Vec::new(),
        };
        for (id, node) in probes {
            match inner
                .transport
                .find_node(
                    inner.config.id.clone(),
                    node.clone(),
                    inner.config.id.clone(),
                )
                .await
            {
                Ok(response) => {
                    if let Some(nodes) = response.nodes {
                        let _ = inner.ingest(nodes);
                    }
                }
                Err(err) => match err.kind() {
                    TransportErrorKind::Timeout { .. } => {
                        warn!("maintenance probe to {} timed out, blacklisting", node.addr);
                        if let Ok(mut table) = inner.table() {
                            table.mark_bad(&id);
                        }
                    }
                    _ => warn!("maintenance probe to {} failed: {}", node.addr, err),
                },
            }
        }
        info!(
            "cleanup done, routing table contains {} nodes",
            inner.node_count()
        );
    }
}

/// SHA-1 of a salt, the iteration counter, and our own id: stable for a
/// given node and iteration, but not guessable by peers ahead of time.
fn discovery_target(id: &NodeID, iteration: u64) -> NodeID {
    let mut hasher = Sha1::new();
    hasher.update(DISCOVERY_SALT);
    hasher.update(iteration.to_be_bytes());
    hasher.update(id.as_bytes());
    NodeID::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn test_config() -> DhtConfig {
        let mut config = DhtConfig::new(0, NodeID::new([0; 20]), b"XX01".to_vec());
        config.bootstrap = Vec::new();
        config
    }

    // Ids spread across the key space so all nine fit the prefix table.
    fn spread_id(index: u8) -> NodeID {
        let mut bytes = [0u8; 20];
        bytes[0] = (index + 1) << 4;
        NodeID::new(bytes)
    }

    #[test]
    fn discovery_targets_differ_per_iteration_but_are_stable() {
        let id = NodeID::new([5; 20]);
        assert_eq!(discovery_target(&id, 1), discovery_target(&id, 1));
        assert_ne!(discovery_target(&id, 1), discovery_target(&id, 2));
        assert_ne!(
            discovery_target(&id, 1),
            discovery_target(&NodeID::new([6; 20]), 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_nodes_are_blacklisted_until_none_remain() {
        let dht = Dht::new(test_config()).await.unwrap();

        // Nine peers that never answer. The table stays above the sparsity
        // threshold, so every timeout blacklists its node.
        let mut sinks = Vec::new();
        for i in 0..(K + 1) as u8 {
            let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = match sink.local_addr().unwrap() {
                SocketAddr::V4(addr) => addr,
                other => panic!("expected IPv4 bind, got {}", other),
            };
            dht.inner
                .table()
                .unwrap()
                .update(&spread_id(i), Arc::new(Node::new(addr)));
            sinks.push(sink);
        }
        assert_eq!(dht.node_count(), K + 1);

        let target = NodeID::new([0xff; 20]);
        let err = dht.find_node(&target, 3).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NotFound);

        // All nine are flagged and excluded from closeness queries.
        assert_eq!(dht.node_count(), K + 1);
        assert!(dht.inner.table().unwrap().closest(&target, K + 1).is_empty());
    }

    #[tokio::test]
    async fn get_peers_on_an_empty_table_is_not_found() {
        let dht = Dht::new(test_config()).await.unwrap();
        let err = dht
            .get_peers(&NodeID::new([9; 20]), DEFAULT_LOOKUP_ATTEMPTS)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dht = Dht::new(test_config()).await.unwrap();
        dht.start().await.unwrap();
        let err = dht.start().await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AlreadyStarted);
        dht.shutdown().await;
    }
}
