//! rdht - A BitTorrent DHT library
//!
//! This library implements the Kademlia-based distributed hash table
//! used by BitTorrent, following the BEP (BitTorrent Enhancement
//! Proposals) specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 routing and peer discovery, BEP-33 scrape,
//!   BEP-42 secure node IDs, BEP-44 immutable/mutable item storage

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    DhtError, DhtServer, DhtSettings, MutableItem, Node, NodeEntry, NodeId, RoutingTable,
};
