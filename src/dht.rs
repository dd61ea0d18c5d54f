//! Distributed Hash Table ([BEP-5]).
//!
//! This module implements the Kademlia-based DHT used by BitTorrent for
//! trackerless peer discovery, including the security extension
//! ([BEP-42]), scrape bloom filters ([BEP-33]) and mutable/immutable
//! item storage ([BEP-44]).
//!
//! # Overview
//!
//! The DHT is a distributed database keyed by 160-bit IDs: peers for
//! each torrent live under the torrent's info-hash, arbitrary small
//! blobs under their SHA-1 (immutable) or under an ed25519 key
//! (mutable, signed, versioned). Nodes route with the Kademlia XOR
//! metric.
//!
//! # Getting Started
//!
//! ```no_run
//! use rdht::dht::DhtServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Bind to a UDP port
//! let dht = DhtServer::bind(6881, Default::default()).await?;
//!
//! // Drive the socket and timers
//! tokio::spawn({
//!     let dht = dht.clone();
//!     async move { dht.run().await }
//! });
//!
//! // Bootstrap from the well-known routers
//! dht.bootstrap(&[]).await?;
//!
//! // Find peers for a torrent
//! let info_hash = rdht::dht::NodeId([0u8; 20]);
//! for peer in dht.get_peers(info_hash).await {
//!     println!("found peer: {}", peer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`DhtServer`] - tokio front-end owning the UDP socket
//! - [`Node`] - single-threaded orchestrator: dispatch, handlers, lookups
//! - [`RoutingTable`] - splitting XOR-bucket tree with replacement caches
//! - [`DhtStorage`] - peer announces plus immutable/mutable items
//! - Traversals - iterative closest-node lookups with bounded branching
//!
//! The node core is deterministic and socket-free; the [`PacketSocket`],
//! [`Clock`] and [`DhtObserver`] traits are the only seams to the
//! outside world, which is also how the tests drive full end-to-end
//! scenarios without networking.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-33]: http://bittorrent.org/beps/bep_0033.html
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html
//! [BEP-44]: http://bittorrent.org/beps/bep_0044.html

mod bloom;
mod error;
mod item;
mod message;
mod node;
mod node_id;
mod node_id_security;
mod routing;
mod rpc;
mod schema;
mod server;
mod settings;
mod storage;
mod token;
mod traversal;

pub use bloom::BloomFilter;
pub use error::DhtError;
pub use item::{
    immutable_target_id, mutable_target_id, sign_mutable_item, verify_mutable_item, MutableItem,
};
pub use message::{error_code, Family};
pub use node::{Clock, DhtObserver, Node, NullObserver, SystemClock};
pub use node_id::{
    compare_ip_cidr, distance_exp, generate_prefix_mask, min_distance_exp, NodeId,
};
pub use node_id_security::{generate_secure_id, generate_secure_node_id, verify_secure_id};
pub use routing::{NodeEntry, RoutingTable, TableSize, RTT_UNKNOWN};
pub use rpc::PacketSocket;
pub use server::{DhtServer, BOOTSTRAP_NODES};
pub use settings::DhtSettings;
pub use storage::{DhtStorage, MutablePutError, MutableReply, PeersReply};
pub use token::TokenManager;
