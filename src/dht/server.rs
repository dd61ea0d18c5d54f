//! Tokio UDP front-end for the DHT node.
//!
//! Owns the socket and the periodic housekeeping interval, and adapts
//! the single-threaded [`Node`] to an async API. All node state is
//! touched under one lock from this server's task and from the async
//! façade methods; the node itself never blocks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::item::MutableItem;
use super::message::Family;
use super::node::{Clock, DhtObserver, Node, NullObserver, SystemClock};
use super::node_id::NodeId;
use super::rpc::PacketSocket;
use super::settings::DhtSettings;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

struct UdpPacketSocket {
    socket: Arc<UdpSocket>,
}

impl PacketSocket for UdpPacketSocket {
    fn has_quota(&self) -> bool {
        true
    }

    fn send(&self, packet: &[u8], addr: SocketAddr) -> bool {
        match self.socket.try_send_to(packet, addr) {
            Ok(_) => true,
            Err(err) => {
                debug!(%addr, %err, "failed to send packet");
                false
            }
        }
    }
}

/// A running DHT node bound to a UDP port.
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::DhtServer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(6881, Default::default()).await?;
///
/// tokio::spawn({
///     let dht = dht.clone();
///     async move { dht.run().await }
/// });
///
/// dht.bootstrap(&[]).await?;
///
/// let info_hash = rdht::dht::NodeId([0u8; 20]);
/// let peers = dht.get_peers(info_hash).await;
/// println!("found {} peers", peers.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DhtServer {
    node: Arc<RwLock<Node>>,
    socket: Arc<UdpSocket>,
    port: u16,
}

impl DhtServer {
    /// Binds a UDP socket and creates the node with a fresh random ID
    /// (re-derived per BEP-42 once the external address is learned).
    pub async fn bind(port: u16, settings: DhtSettings) -> Result<Self, DhtError> {
        Self::bind_with_observer(port, settings, Arc::new(NullObserver)).await
    }

    pub async fn bind_with_observer(
        port: u16,
        settings: DhtSettings,
        observer: Arc<dyn DhtObserver>,
    ) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_addr = socket.local_addr()?;
        let id = NodeId::generate();

        info!("DHT node bound to {} with id {}", local_addr, id);

        let packet_socket = Arc::new(UdpPacketSocket {
            socket: Arc::clone(&socket),
        });
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let node = Node::new(id, Family::V4, packet_socket, settings, observer, clock);

        Ok(Self {
            node: Arc::new(RwLock::new(node)),
            socket,
            port: local_addr.port(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node_id(&self) -> NodeId {
        *self.node.read().nid()
    }

    /// Direct access to the node, for integration into an existing loop.
    pub fn node(&self) -> &Arc<RwLock<Node>> {
        &self.node
    }

    /// Receive loop plus housekeeping timer. Runs until the socket
    /// errors.
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65535];
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, from) = result?;
                    let packet = Bytes::copy_from_slice(&buf[..n]);
                    self.node.write().incoming(&packet, from);
                }
                _ = tick.tick() => {
                    self.node.write().tick();
                }
            }
        }
    }

    /// Bootstraps from the given endpoints, falling back to the
    /// well-known routers. Resolves once the bootstrap lookup completes.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
        let mut endpoints: Vec<SocketAddr> = seeds.to_vec();

        if endpoints.is_empty() {
            for host in BOOTSTRAP_NODES.iter().copied() {
                match tokio::net::lookup_host(host).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                            endpoints.push(addr);
                        }
                    }
                    Err(err) => warn!(host, %err, "failed to resolve bootstrap node"),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.node.write().bootstrap(endpoints, move |responses| {
            let _ = tx.send(responses);
        });

        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Looks up peers for an info-hash and returns the collected set
    /// when the lookup completes.
    pub async fn get_peers(&self, info_hash: NodeId) -> Vec<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.node
            .write()
            .get_peers(info_hash, |_| {}, move |peers| {
                let _ = tx.send(peers);
            });

        rx.await.unwrap_or_default()
    }

    /// Announces on an info-hash; `port` 0 announces the implied port.
    /// Peer results stream into `on_peers`.
    pub fn announce(
        &self,
        info_hash: NodeId,
        port: u16,
        seed: bool,
        on_peers: impl FnMut(&[SocketAddr]) + Send + 'static,
    ) {
        self.node.write().announce(info_hash, port, seed, on_peers);
    }

    /// Fetches an immutable item.
    pub async fn get_item(&self, target: NodeId) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.node.write().get_item(target, move |item| {
            let _ = tx.send(item);
        });

        rx.await.ok().flatten()
    }

    /// Fetches a mutable item.
    pub async fn get_mutable_item(
        &self,
        public_key: [u8; 32],
        salt: impl Into<Bytes>,
    ) -> Option<MutableItem> {
        let (tx, rx) = oneshot::channel();
        self.node
            .write()
            .get_mutable_item(public_key, salt, move |item| {
                let _ = tx.send(item);
            });

        rx.await.ok().flatten()
    }

    /// Stores an immutable item; resolves to the number of nodes that
    /// acknowledged the write.
    pub async fn put_item(&self, value: Bytes) -> Result<usize, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.node.write().put_item(value, move |acked| {
            let _ = tx.send(acked);
        })?;

        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Stores a mutable item; `data` signs the item once the closest
    /// nodes (and the highest sequence number seen so far) are known.
    pub async fn put_mutable_item(
        &self,
        public_key: [u8; 32],
        salt: impl Into<Bytes>,
        data: impl FnOnce(Option<&MutableItem>) -> MutableItem + Send + 'static,
    ) -> Result<usize, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.node
            .write()
            .put_mutable_item(public_key, salt, None, data, move |acked| {
                let _ = tx.send(acked);
            });

        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Abandons all running lookups.
    pub fn shutdown(&self) {
        self.node.write().shutdown();
    }
}
