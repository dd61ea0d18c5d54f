use std::time::Duration;

/// Tunables for the DHT node.
///
/// Every field has a sensible default; construct with
/// `DhtSettings::default()` and override what you need.
#[derive(Debug, Clone)]
pub struct DhtSettings {
    /// Maximum number of info-hashes tracked in the peer store.
    pub max_torrents: usize,

    /// Maximum number of immutable and mutable items stored (each table).
    pub max_dht_items: usize,

    /// Maximum number of peers stored per info-hash.
    pub max_peers: usize,

    /// Reject nodes whose ID does not match their external IP per BEP-42.
    pub enforce_node_id: bool,

    /// Allow at most one routing entry per /24 (IPv4) or /64 (IPv6)
    /// within a bucket.
    pub restrict_routing_ips: bool,

    /// Enlarge the first buckets (128, 64, 32, 16, then 8) to keep the
    /// top of the tree well populated.
    pub extended_routing_table: bool,

    /// Don't answer queries and don't let queriers into the routing
    /// table; outgoing queries carry `ro: 1`.
    pub read_only: bool,

    /// Lookup parallelism (the Kademlia alpha parameter).
    pub search_branching: usize,

    /// How long a peer that sends undecodable packets is ignored.
    pub block_timeout: Duration,

    /// Expiry for stored immutable and mutable items. `None` keeps items
    /// until evicted by storage pressure.
    pub item_lifetime: Option<Duration>,

    /// Expiry for peer announcements.
    pub announce_lifetime: Duration,

    /// Failures before a routing entry is dropped.
    pub max_fail_count: u8,

    /// How long to wait for a reply before an RPC times out.
    pub request_timeout: Duration,

    /// Live entries per routing bucket (the Kademlia k parameter).
    pub bucket_size: usize,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            max_torrents: 2000,
            max_dht_items: 700,
            max_peers: 500,
            enforce_node_id: false,
            restrict_routing_ips: true,
            extended_routing_table: true,
            read_only: false,
            search_branching: 3,
            block_timeout: Duration::from_secs(5 * 60),
            item_lifetime: None,
            announce_lifetime: Duration::from_secs(30 * 60),
            max_fail_count: 20,
            request_timeout: Duration::from_secs(15),
            bucket_size: 8,
        }
    }
}
