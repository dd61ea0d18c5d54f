//! The Kademlia routing table.
//!
//! Buckets form a growing tree over the XOR metric: bucket `i` holds
//! nodes whose distance exponent from our ID is `159 - i`, and the last
//! bucket covers everything deeper. When the last bucket overflows it
//! splits along the next bit, so detail accumulates around our own ID.
//! Each bucket keeps a replacement cache of fresh candidates to promote
//! when a live entry goes quiet.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use super::node_id::{compare_ip_cidr, distance_exp, NodeId};
use super::node_id_security::verify_secure_id;
use super::settings::DhtSettings;

/// The deepest the bucket tree is allowed to grow.
const MAX_BUCKETS: usize = 159;

/// Round-trip time placeholder for nodes we have never measured (e.g.
/// inbound queriers).
pub const RTT_UNKNOWN: u16 = u16::MAX;

/// A node known to the routing table.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Smoothed round-trip time in milliseconds, [`RTT_UNKNOWN`] until a
    /// reply has been measured.
    pub rtt: u16,
    pub timeout_count: u8,
    pub last_seen: Instant,
    /// The ID matches the endpoint per BEP-42.
    pub verified: bool,
}

impl NodeEntry {
    fn new(id: NodeId, addr: SocketAddr, rtt: u16, now: Instant) -> Self {
        let verified = verify_secure_id(&id, &addr.ip());
        Self {
            id,
            addr,
            rtt,
            timeout_count: 0,
            last_seen: now,
            verified,
        }
    }

    /// A confirmed entry has answered us and isn't currently failing;
    /// only confirmed traffic may split buckets.
    pub fn confirmed(&self) -> bool {
        self.timeout_count == 0 && self.rtt != RTT_UNKNOWN
    }

    fn seen(&mut self, rtt: u16, now: Instant) {
        if rtt != RTT_UNKNOWN {
            self.rtt = if self.rtt == RTT_UNKNOWN {
                rtt
            } else {
                // 2:1 exponential smoothing
                ((self.rtt as u32 * 2 + rtt as u32) / 3) as u16
            };
        }
        self.timeout_count = 0;
        self.last_seen = now;
    }
}

#[derive(Default)]
struct Bucket {
    live: Vec<NodeEntry>,
    replacements: Vec<NodeEntry>,
}

/// Counts reported by [`RoutingTable::size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSize {
    pub live: usize,
    pub replacements: usize,
    pub confirmed: usize,
}

pub struct RoutingTable {
    id: NodeId,
    buckets: Vec<Bucket>,
    /// Bootstrap seeds with unknown IDs; never returned by `find_node`,
    /// only used to start traversals on an empty table.
    router_nodes: Vec<SocketAddr>,
    settings: DhtSettings,
}

impl RoutingTable {
    pub fn new(id: NodeId, settings: DhtSettings) -> Self {
        Self {
            id,
            buckets: vec![Bucket::default()],
            router_nodes: Vec::new(),
            settings,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn num_active_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |b| b.live.len())
    }

    /// Live-entry capacity of a bucket. With the extended table the top
    /// buckets are enlarged (128, 64, 32, 16, then 8 for k=8).
    fn bucket_limit(&self, index: usize) -> usize {
        if self.settings.extended_routing_table && index < 4 {
            return self.settings.bucket_size * (16 >> index);
        }
        self.settings.bucket_size
    }

    pub fn add_router_node(&mut self, addr: SocketAddr) {
        if !self.router_nodes.contains(&addr) {
            self.router_nodes.push(addr);
        }
    }

    pub fn router_nodes(&self) -> &[SocketAddr] {
        &self.router_nodes
    }

    pub fn size(&self) -> TableSize {
        let mut size = TableSize {
            live: 0,
            replacements: 0,
            confirmed: 0,
        };
        for bucket in &self.buckets {
            size.live += bucket.live.len();
            size.replacements += bucket.replacements.len();
            size.confirmed += bucket.live.iter().filter(|e| e.confirmed()).count();
        }
        size
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        (159 - distance_exp(&self.id, id)).min(self.buckets.len() - 1)
    }

    /// Records an observation of a node.
    ///
    /// `rtt` is the measured round-trip in milliseconds when the
    /// observation is a reply to us, or [`RTT_UNKNOWN`] for unsolicited
    /// traffic. Returns whether the node now has a live entry.
    pub fn node_seen(&mut self, id: NodeId, addr: SocketAddr, rtt: u16, now: Instant) -> bool {
        if id == self.id {
            return false;
        }

        if self.settings.enforce_node_id && !verify_secure_id(&id, &addr.ip()) {
            debug!(%id, %addr, "rejecting node with invalid secure id");
            return false;
        }

        loop {
            let index = self.bucket_index(&id);
            let is_last = index + 1 == self.buckets.len();
            let limit = self.bucket_limit(index);
            let bucket = &mut self.buckets[index];

            // same id: refresh, but only at the endpoint we know it by
            if let Some(existing) = bucket.live.iter_mut().find(|e| e.id == id) {
                if existing.addr != addr {
                    return false;
                }
                existing.seen(rtt, now);
                return true;
            }

            // same endpoint under a new id means the node restarted or
            // someone is squatting the address; drop the stale entry and
            // don't trust the new id either
            if let Some(pos) = bucket.live.iter().position(|e| e.addr == addr) {
                bucket.live.swap_remove(pos);
                Self::promote_replacement(bucket);
                return false;
            }

            if let Some(pos) = bucket.replacements.iter().position(|e| e.id == id) {
                if bucket.replacements[pos].addr != addr {
                    return false;
                }
                bucket.replacements[pos].seen(rtt, now);
                if bucket.live.len() < limit {
                    let entry = bucket.replacements.swap_remove(pos);
                    bucket.live.push(entry);
                }
                return true;
            }
            if let Some(pos) = bucket.replacements.iter().position(|e| e.addr == addr) {
                bucket.replacements.swap_remove(pos);
                return false;
            }

            // anti-Sybil: one live entry per /24 (v4) or /64 (v6) per
            // bucket
            if self.settings.restrict_routing_ips
                && bucket
                    .live
                    .iter()
                    .chain(bucket.replacements.iter())
                    .any(|e| compare_ip_cidr(&e.addr.ip(), &addr.ip()))
            {
                debug!(%id, %addr, "rejecting node, CIDR already occupied in bucket");
                return false;
            }

            let entry = NodeEntry::new(id, addr, rtt, now);

            if bucket.live.len() < limit {
                bucket.live.push(entry);
                return true;
            }

            // full live list: new nodes accumulate in the replacement
            // cache first
            if bucket.replacements.len() < self.settings.bucket_size {
                bucket.replacements.push(entry);
                return false;
            }

            // live list and cache both full; the last bucket may split,
            // provided the tree is not degenerating into a chain of
            // empty levels
            let can_split = is_last
                && self.buckets.len() < MAX_BUCKETS
                && entry.confirmed()
                && (index == 0 || !self.buckets[index - 1].live.is_empty());

            if can_split {
                self.split_last_bucket();
                continue;
            }

            // evict the least valuable replacement: unverified before
            // verified, oldest first
            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket
                .replacements
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.verified, e.last_seen))
                .map(|(i, _)| i)
            {
                bucket.replacements[pos] = entry;
            }
            return false;
        }
    }

    fn split_last_bucket(&mut self) {
        let index = self.buckets.len() - 1;
        self.buckets.push(Bucket::default());

        let split = |entries: &mut Vec<NodeEntry>, id: &NodeId| -> Vec<NodeEntry> {
            let mut moved = Vec::new();
            let mut kept = Vec::new();
            for entry in entries.drain(..) {
                if 159 - distance_exp(id, &entry.id) > index {
                    moved.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
            moved
        };

        let id = self.id;
        let moved_live = split(&mut self.buckets[index].live, &id);
        let moved_replacements = split(&mut self.buckets[index].replacements, &id);

        let new_limit = self.bucket_limit(index + 1);
        let new_bucket = &mut self.buckets[index + 1];
        for entry in moved_live {
            if new_bucket.live.len() < new_limit {
                new_bucket.live.push(entry);
            } else {
                new_bucket.replacements.push(entry);
            }
        }
        new_bucket.replacements.extend(moved_replacements);
        new_bucket
            .replacements
            .truncate(self.settings.bucket_size.max(new_limit));
    }

    fn promote_replacement(bucket: &mut Bucket) {
        // prefer verified, then most recently seen
        if let Some(pos) = bucket
            .replacements
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.verified, e.last_seen))
            .map(|(i, _)| i)
        {
            let entry = bucket.replacements.swap_remove(pos);
            bucket.live.push(entry);
        }
    }

    /// Records a failed query toward a node. The entry is removed once it
    /// exceeds the failure budget (or immediately if it never answered),
    /// and a cached replacement takes its place.
    pub fn node_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        if *id == self.id {
            return;
        }

        let max_fail_count = self.settings.max_fail_count;
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];

        let Some(pos) = bucket.live.iter().position(|e| e.id == *id) else {
            if let Some(pos) = bucket.replacements.iter().position(|e| e.id == *id) {
                if bucket.replacements[pos].addr == *addr {
                    bucket.replacements.swap_remove(pos);
                }
            }
            return;
        };

        if bucket.live[pos].addr != *addr {
            return;
        }

        let entry = &mut bucket.live[pos];
        entry.timeout_count = entry.timeout_count.saturating_add(1);

        if entry.timeout_count >= max_fail_count || entry.rtt == RTT_UNKNOWN {
            bucket.live.swap_remove(pos);
            Self::promote_replacement(bucket);
        }
    }

    /// Collects the `count` live entries closest to `target` by XOR
    /// distance. Entries currently timing out are skipped unless
    /// `include_failed`.
    pub fn find_node(
        &self,
        target: &NodeId,
        include_failed: bool,
        count: usize,
    ) -> Vec<NodeEntry> {
        let mut nodes: Vec<&NodeEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|e| include_failed || e.timeout_count == 0)
            .collect();

        nodes.sort_by(|a, b| {
            target
                .distance(&a.id)
                .cmp(&target.distance(&b.id))
                .then_with(|| (!a.verified, a.rtt).cmp(&(!b.verified, b.rtt)))
        });
        nodes.truncate(count);
        nodes.into_iter().cloned().collect()
    }

    /// Visits every live entry and every replacement-cache entry.
    pub fn for_each_node(
        &self,
        mut live_cb: impl FnMut(&NodeEntry),
        mut cache_cb: impl FnMut(&NodeEntry),
    ) {
        for bucket in &self.buckets {
            for entry in &bucket.live {
                live_cb(entry);
            }
            for entry in &bucket.replacements {
                cache_cb(entry);
            }
        }
    }

    /// Rebuilds the table around a new owner ID, keeping every entry
    /// that still fits somewhere.
    pub fn update_node_id(&mut self, new_id: NodeId) {
        let mut entries = Vec::new();
        let mut replacements = Vec::new();
        for bucket in &mut self.buckets {
            entries.append(&mut bucket.live);
            replacements.append(&mut bucket.replacements);
        }

        self.id = new_id;
        self.buckets = vec![Bucket::default()];

        for entry in entries.into_iter().chain(replacements) {
            self.insert_entry(entry);
        }
    }

    /// Re-inserts a pre-existing entry, preserving its statistics.
    fn insert_entry(&mut self, entry: NodeEntry) {
        if entry.id == self.id {
            return;
        }
        loop {
            let index = self.bucket_index(&entry.id);
            let is_last = index + 1 == self.buckets.len();
            let limit = self.bucket_limit(index);
            let bucket = &mut self.buckets[index];

            if bucket.live.len() < limit {
                bucket.live.push(entry);
                return;
            }

            if bucket.replacements.len() < self.settings.bucket_size {
                bucket.replacements.push(entry);
                return;
            }

            let can_split = is_last
                && self.buckets.len() < MAX_BUCKETS
                && entry.confirmed()
                && (index == 0 || !self.buckets[index - 1].live.is_empty());
            if can_split {
                self.split_last_bucket();
                continue;
            }
            return;
        }
    }

    /// A random ID that would land in the given bucket, for refreshes.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        use rand::Rng as _;

        if index >= MAX_BUCKETS {
            return NodeId::generate();
        }

        // flip the bucket's distinguishing bit, randomize everything
        // after it
        let mut id = self.id.0;
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        id[byte_index] ^= 1 << bit_index;

        if bit_index > 0 {
            let random_byte: u8 = rand::rng().random();
            let keep_mask = !((1u8 << bit_index) - 1);
            id[byte_index] = (id[byte_index] & keep_mask) | (random_byte & !keep_mask);
        }
        for byte in id.iter_mut().skip(byte_index + 1) {
            *byte = rand::rng().random();
        }

        NodeId(id)
    }

    /// Buckets whose freshest entry is older than the refresh interval.
    pub fn stale_buckets(&self, now: Instant, max_age: std::time::Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.live.is_empty()
                    && b.live
                        .iter()
                        .all(|e| now.duration_since(e.last_seen) > max_age)
            })
            .map(|(i, _)| i)
            .collect()
    }
}
