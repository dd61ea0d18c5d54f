//! Node-side storage: peer announcements, immutable items, mutable items.
//!
//! All three tables are bounded. Peer lists expire by age; items are
//! evicted "least valuable first", where value is XOR closeness of the
//! item's target to this node's ID, so the keyspace each node is
//! responsible for is retained longest.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::bloom::BloomFilter;
use super::item::MutableItem;
use super::node_id::NodeId;
use super::settings::DhtSettings;

/// How many peers a single `get_peers` response may carry.
const MAX_PEERS_REPLY: usize = 100;

struct PeerEntry {
    addr: SocketAddr,
    seed: bool,
    added: Instant,
}

#[derive(Default)]
struct TorrentPeers {
    peers: Vec<PeerEntry>,
    name: Option<Bytes>,
}

struct StoredImmutable {
    value: Bytes,
    added: Instant,
}

struct StoredMutable {
    item: MutableItem,
    added: Instant,
}

/// The result of a mutable put that was rejected by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutablePutError {
    /// The stored item has a higher sequence number (error 302).
    LowerSeq,
    /// A `cas` was supplied and does not match the stored sequence
    /// number (error 301).
    CasMismatch,
}

/// A `get_peers` lookup result.
pub struct PeersReply {
    pub peers: Vec<SocketAddr>,
    pub name: Option<Bytes>,
    pub seeds: Option<BloomFilter>,
    pub downloaders: Option<BloomFilter>,
}

/// A mutable `get` lookup result.
pub struct MutableReply {
    pub item: MutableItem,
    /// When set, the requester already holds this sequence number and
    /// the response omits `v`, `k` and `sig`.
    pub conditional: bool,
}

pub struct DhtStorage {
    node_id: NodeId,
    torrents: HashMap<NodeId, TorrentPeers>,
    immutable: HashMap<NodeId, StoredImmutable>,
    mutable: HashMap<NodeId, StoredMutable>,
    settings: DhtSettings,
}

impl DhtStorage {
    pub fn new(node_id: NodeId, settings: DhtSettings) -> Self {
        Self {
            node_id,
            torrents: HashMap::new(),
            immutable: HashMap::new(),
            mutable: HashMap::new(),
            settings,
        }
    }

    /// Eviction distance is measured from the node's ID; keep it current.
    pub fn update_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    /// Records a peer announcement for an info-hash.
    pub fn announce_peer(
        &mut self,
        info_hash: NodeId,
        addr: SocketAddr,
        seed: bool,
        name: Option<Bytes>,
        now: Instant,
    ) {
        if !self.torrents.contains_key(&info_hash)
            && self.torrents.len() >= self.settings.max_torrents
            && !self.evict_farthest(&info_hash, Table::Torrents)
        {
            debug!(%info_hash, "peer store full, dropping announce");
            return;
        }

        let torrent = self.torrents.entry(info_hash).or_default();
        if let Some(name) = name {
            // advisory torrent name (BEP-5 `n` key), first writer wins
            torrent.name.get_or_insert(name);
        }

        if let Some(existing) = torrent.peers.iter_mut().find(|p| p.addr == addr) {
            existing.seed = seed;
            existing.added = now;
            return;
        }

        if torrent.peers.len() >= self.settings.max_peers {
            // refresh pressure: drop the stalest announce
            if let Some(oldest) = torrent
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.added)
                .map(|(i, _)| i)
            {
                torrent.peers.swap_remove(oldest);
            }
        }

        torrent.peers.push(PeerEntry { addr, seed, added: now });
    }

    /// Looks up peers for an info-hash. With `scrape` the peer list is
    /// replaced by the two BEP-33 bloom filters.
    pub fn get_peers(&self, info_hash: &NodeId, scrape: bool, family: super::message::Family) -> Option<PeersReply> {
        let torrent = self.torrents.get(info_hash)?;

        if scrape {
            let mut seeds = BloomFilter::new();
            let mut downloaders = BloomFilter::new();
            for peer in &torrent.peers {
                let ip = peer.addr.ip();
                if peer.seed {
                    seeds.insert_ip(&ip);
                } else {
                    downloaders.insert_ip(&ip);
                }
            }
            return Some(PeersReply {
                peers: Vec::new(),
                name: torrent.name.clone(),
                seeds: Some(seeds),
                downloaders: Some(downloaders),
            });
        }

        let peers = torrent
            .peers
            .iter()
            .filter(|p| super::message::Family::of(&p.addr) == family)
            .take(MAX_PEERS_REPLY)
            .map(|p| p.addr)
            .collect();

        Some(PeersReply {
            peers,
            name: torrent.name.clone(),
            seeds: None,
            downloaders: None,
        })
    }

    /// Stores an immutable item. Never fails; under pressure the farthest
    /// stored item gives way iff the new one is closer to the node's ID.
    pub fn put_immutable(&mut self, target: NodeId, value: Bytes, now: Instant) {
        if let Some(existing) = self.immutable.get_mut(&target) {
            existing.added = now;
            return;
        }

        if self.immutable.len() >= self.settings.max_dht_items
            && !self.evict_farthest(&target, Table::Immutable)
        {
            return;
        }

        self.immutable
            .insert(target, StoredImmutable { value, added: now });
    }

    pub fn get_immutable(&self, target: &NodeId) -> Option<&Bytes> {
        self.immutable.get(target).map(|stored| &stored.value)
    }

    /// Stores or updates a mutable item. The caller has already verified
    /// the signature; this enforces the sequence-number and CAS rules.
    pub fn put_mutable(
        &mut self,
        item: MutableItem,
        cas: Option<u64>,
        now: Instant,
    ) -> Result<(), MutablePutError> {
        let target = item.target();

        if let Some(stored) = self.mutable.get_mut(&target) {
            if let Some(cas) = cas {
                if stored.item.seq != cas {
                    return Err(MutablePutError::CasMismatch);
                }
            }
            if item.seq < stored.item.seq {
                return Err(MutablePutError::LowerSeq);
            }
            if item.seq == stored.item.seq && item.value != stored.item.value {
                return Err(MutablePutError::LowerSeq);
            }
            stored.item = item;
            stored.added = now;
            return Ok(());
        }

        if self.mutable.len() >= self.settings.max_dht_items
            && !self.evict_farthest(&target, Table::Mutable)
        {
            // full and less valuable than everything stored; BEP-44 has
            // no error for this, the write just doesn't stick
            return Ok(());
        }

        self.mutable.insert(target, StoredMutable { item, added: now });
        Ok(())
    }

    /// Fetches a mutable item; `seq_floor` is the requester's `seq`
    /// argument for conditional gets.
    pub fn get_mutable(&self, target: &NodeId, seq_floor: Option<u64>) -> Option<MutableReply> {
        let stored = self.mutable.get(target)?;
        Some(MutableReply {
            item: stored.item.clone(),
            conditional: seq_floor == Some(stored.item.seq),
        })
    }

    /// Expires aged peers and items.
    pub fn tick(&mut self, now: Instant) {
        let announce_lifetime = self.settings.announce_lifetime;
        for torrent in self.torrents.values_mut() {
            torrent
                .peers
                .retain(|p| now.duration_since(p.added) < announce_lifetime);
        }
        self.torrents.retain(|_, t| !t.peers.is_empty());

        if let Some(lifetime) = self.settings.item_lifetime {
            self.immutable
                .retain(|_, stored| now.duration_since(stored.added) < lifetime);
            self.mutable
                .retain(|_, stored| now.duration_since(stored.added) < lifetime);
        }
    }

    pub fn num_torrents(&self) -> usize {
        self.torrents.len()
    }

    pub fn num_immutable(&self) -> usize {
        self.immutable.len()
    }

    pub fn num_mutable(&self) -> usize {
        self.mutable.len()
    }

    /// Removes the stored key farthest from the node's ID, provided the
    /// incoming key is closer. Returns whether a slot was freed.
    fn evict_farthest(&mut self, incoming: &NodeId, table: Table) -> bool {
        let farthest = match table {
            Table::Torrents => self.torrents.keys().max_by_key(|k| self.node_id.distance(k)),
            Table::Immutable => self.immutable.keys().max_by_key(|k| self.node_id.distance(k)),
            Table::Mutable => self.mutable.keys().max_by_key(|k| self.node_id.distance(k)),
        };

        let Some(farthest) = farthest.copied() else {
            return false;
        };

        if self.node_id.distance(incoming) >= self.node_id.distance(&farthest) {
            return false;
        }

        match table {
            Table::Torrents => {
                self.torrents.remove(&farthest);
            }
            Table::Immutable => {
                self.immutable.remove(&farthest);
            }
            Table::Mutable => {
                self.mutable.remove(&farthest);
            }
        }
        true
    }
}

#[derive(Clone, Copy)]
enum Table {
    Torrents,
    Immutable,
    Mutable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::item::{immutable_target_id, sign_mutable_item};
    use crate::dht::message::Family;
    use std::time::Duration;

    fn storage(max_items: usize) -> DhtStorage {
        let settings = DhtSettings {
            max_dht_items: max_items,
            max_torrents: max_items,
            ..DhtSettings::default()
        };
        DhtStorage::new(NodeId::ZERO, settings)
    }

    fn addr(i: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(1, 2, 3, i)), 6881)
    }

    fn target(msb: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = msb;
        id[19] = 1;
        NodeId(id)
    }

    #[test]
    fn test_announce_and_get_peers() {
        let mut storage = storage(8);
        let now = Instant::now();
        let ih = target(1);

        storage.announce_peer(ih, addr(1), false, Some(Bytes::from_static(b"test")), now);
        storage.announce_peer(ih, addr(2), true, None, now);

        let reply = storage.get_peers(&ih, false, Family::V4).unwrap();
        assert_eq!(reply.peers.len(), 2);
        assert_eq!(reply.name.as_deref(), Some(&b"test"[..]));
        assert!(reply.seeds.is_none());

        assert!(storage.get_peers(&target(9), false, Family::V4).is_none());
    }

    #[test]
    fn test_announce_refresh_same_endpoint() {
        let mut storage = storage(8);
        let now = Instant::now();
        let ih = target(1);

        storage.announce_peer(ih, addr(1), false, None, now);
        storage.announce_peer(ih, addr(1), true, None, now);

        let reply = storage.get_peers(&ih, true, Family::V4).unwrap();
        assert!((reply.seeds.unwrap().size() - 1.0).abs() < 0.5);
        assert!(reply.downloaders.unwrap().size() < 0.5);
    }

    #[test]
    fn test_peers_expire() {
        let mut storage = storage(8);
        let now = Instant::now();
        let ih = target(1);

        storage.announce_peer(ih, addr(1), false, None, now);
        storage.tick(now + Duration::from_secs(31 * 60));

        assert!(storage.get_peers(&ih, false, Family::V4).is_none());
        assert_eq!(storage.num_torrents(), 0);
    }

    #[test]
    fn test_immutable_eviction_prefers_closer() {
        let mut storage = storage(2);
        let now = Instant::now();

        storage.put_immutable(target(0x80), Bytes::from_static(b"far"), now);
        storage.put_immutable(target(0x40), Bytes::from_static(b"mid"), now);
        assert_eq!(storage.num_immutable(), 2);

        // closer than both: evicts the farthest
        storage.put_immutable(target(0x01), Bytes::from_static(b"near"), now);
        assert_eq!(storage.num_immutable(), 2);
        assert!(storage.get_immutable(&target(0x80)).is_none());
        assert!(storage.get_immutable(&target(0x01)).is_some());

        // farther than everything stored: not admitted
        storage.put_immutable(target(0xf0), Bytes::from_static(b"farther"), now);
        assert!(storage.get_immutable(&target(0xf0)).is_none());
    }

    fn signed_item(seq: u64, value: &'static [u8]) -> MutableItem {
        let mut pk = [0u8; 32];
        let mut sk = [0u8; 64];
        hex::decode_to_slice(
            "77ff84905a91936367c01360803104f92432fcd904a43511876df5cdf3e7e548",
            &mut pk,
        )
        .unwrap();
        hex::decode_to_slice(
            "e06d3183d14159228433ed599221b80bd0a5ce8352e4bdf0262f76786ef1c74d\
             b7e7a9fea2c0eb269d61e3b38e450a22e754941ac78479d6c54e1faf6037881d",
            &mut sk,
        )
        .unwrap();

        let signature = sign_mutable_item(value, b"", seq, &pk, &sk).unwrap();
        MutableItem {
            value: Bytes::from_static(value),
            public_key: pk,
            signature,
            seq,
            salt: Bytes::new(),
        }
    }

    #[test]
    fn test_mutable_seq_monotone() {
        let mut storage = storage(8);
        let now = Instant::now();

        storage.put_mutable(signed_item(4, b"3:one"), None, now).unwrap();

        // lower sequence number is rejected
        assert_eq!(
            storage.put_mutable(signed_item(3, b"3:two"), None, now),
            Err(MutablePutError::LowerSeq)
        );

        // same sequence number with a different value is rejected
        assert_eq!(
            storage.put_mutable(signed_item(4, b"3:two"), None, now),
            Err(MutablePutError::LowerSeq)
        );

        // same sequence number, same value: idempotent refresh
        storage.put_mutable(signed_item(4, b"3:one"), None, now).unwrap();

        storage.put_mutable(signed_item(5, b"3:two"), None, now).unwrap();
        let reply = storage.get_mutable(&signed_item(5, b"3:two").target(), None).unwrap();
        assert_eq!(reply.item.seq, 5);
        assert_eq!(reply.item.value.as_ref(), b"3:two");
    }

    #[test]
    fn test_mutable_cas() {
        let mut storage = storage(8);
        let now = Instant::now();

        storage.put_mutable(signed_item(4, b"3:one"), None, now).unwrap();

        // cas matches the stored seq: accepted
        storage.put_mutable(signed_item(5, b"3:two"), Some(4), now).unwrap();

        // replaying the same cas now mismatches
        assert_eq!(
            storage.put_mutable(signed_item(5, b"3:two"), Some(4), now),
            Err(MutablePutError::CasMismatch)
        );
    }

    #[test]
    fn test_conditional_get() {
        let mut storage = storage(8);
        let now = Instant::now();
        let item = signed_item(4, b"3:one");
        let target = item.target();

        storage.put_mutable(item, None, now).unwrap();

        assert!(!storage.get_mutable(&target, Some(3)).unwrap().conditional);
        assert!(storage.get_mutable(&target, Some(4)).unwrap().conditional);
        assert!(!storage.get_mutable(&target, None).unwrap().conditional);
    }
}
