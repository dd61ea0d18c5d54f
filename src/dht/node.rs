//! The DHT node: message dispatch, query handlers, and the user-facing
//! lookup API.
//!
//! The node is single-threaded: every method runs to completion on the
//! caller's loop, and "waiting" only ever takes the form of a pending
//! RPC entry or a registered callback. The socket and clock are injected
//! capabilities, which is also what makes the end-to-end tests
//! deterministic.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::item::{
    self, immutable_target_id, mutable_target_id, MutableItem, MAX_ITEM_LEN, MAX_SALT_LEN,
    PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use super::message::{self, bkey, error_code, Family, TransactionId};
use super::node_id::NodeId;
use super::node_id_security::{generate_secure_node_id, verify_secure_id};
use super::routing::{RoutingTable, TableSize, RTT_UNKNOWN};
use super::rpc::{PacketSocket, PendingRequest, RpcContext, RpcManager};
use super::schema::{verify_message, KeyDesc, KeyKind};
use super::settings::DhtSettings;
use super::storage::{DhtStorage, MutablePutError};
use super::token::TokenManager;
use super::traversal::{CandidateState, Traversal, TraversalId, TraversalKind, WritePhase};
use crate::bencode::{decode_buf, Value};

/// Buckets older than this get refreshed with a `find_node` lookup.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Hooks into the surrounding session.
///
/// All methods have no-op defaults; implement what you need.
pub trait DhtObserver: Send + Sync {
    /// A response carried an `ip` field claiming this is our external
    /// address, as seen by `source`.
    fn set_external_address(&self, _addr: IpAddr, _source: IpAddr) {}

    /// Our current external address for the given family, if known.
    /// Drives BEP-42 node ID derivation.
    fn external_address(&self, _family: Family) -> Option<IpAddr> {
        None
    }

    /// Somebody asked us for peers on this info-hash.
    fn on_get_peers(&self, _info_hash: &NodeId) {}

    /// Somebody announced themselves on this info-hash.
    fn on_announce(&self, _info_hash: &NodeId, _addr: IpAddr, _port: u16) {}
}

/// An observer that ignores everything.
pub struct NullObserver;

impl DhtObserver for NullObserver {}

const PING_DESC: &[KeyDesc] = &[
    KeyDesc::new("q", KeyKind::Str, 0, 0),
    KeyDesc::new("a", KeyKind::Dict, 0, KeyDesc::PARSE_CHILDREN),
    KeyDesc::new("id", KeyKind::Str, 20, KeyDesc::LAST_CHILD),
];

const FIND_NODE_DESC: &[KeyDesc] = &[
    KeyDesc::new("target", KeyKind::Str, 20, 0),
    KeyDesc::new("want", KeyKind::List, 0, KeyDesc::OPTIONAL),
];

const GET_PEERS_DESC: &[KeyDesc] = &[
    KeyDesc::new("info_hash", KeyKind::Str, 20, 0),
    KeyDesc::new("scrape", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("want", KeyKind::List, 0, KeyDesc::OPTIONAL),
];

const ANNOUNCE_DESC: &[KeyDesc] = &[
    KeyDesc::new("info_hash", KeyKind::Str, 20, 0),
    KeyDesc::new("token", KeyKind::Str, 0, 0),
    KeyDesc::new("port", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("implied_port", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("seed", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("n", KeyKind::Str, 0, KeyDesc::OPTIONAL),
];

const GET_DESC: &[KeyDesc] = &[
    KeyDesc::new("target", KeyKind::Str, 20, 0),
    KeyDesc::new("seq", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("want", KeyKind::List, 0, KeyDesc::OPTIONAL),
];

const PUT_DESC: &[KeyDesc] = &[
    KeyDesc::new("token", KeyKind::Str, 0, 0),
    KeyDesc::new("v", KeyKind::Any, 0, 0),
    KeyDesc::new("k", KeyKind::Str, PUBLIC_KEY_LEN, KeyDesc::OPTIONAL),
    KeyDesc::new("sig", KeyKind::Str, SIGNATURE_LEN, KeyDesc::OPTIONAL),
    KeyDesc::new("seq", KeyKind::Int, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("salt", KeyKind::Str, 0, KeyDesc::OPTIONAL),
    KeyDesc::new("cas", KeyKind::Int, 0, KeyDesc::OPTIONAL),
];

pub struct Node {
    id: NodeId,
    family: Family,
    settings: DhtSettings,
    socket: Arc<dyn PacketSocket + Send + Sync>,
    observer: Arc<dyn DhtObserver>,
    clock: Arc<dyn Clock>,
    table_v4: RoutingTable,
    table_v6: RoutingTable,
    storage: DhtStorage,
    tokens: TokenManager,
    rpc: RpcManager,
    traversals: HashMap<TraversalId, Traversal>,
    next_traversal_id: TraversalId,
    /// Senders of undecodable packets, ignored until the deadline.
    blocked: HashMap<IpAddr, Instant>,
    next_bucket_refresh: Instant,
}

impl Node {
    pub fn new(
        id: NodeId,
        family: Family,
        socket: Arc<dyn PacketSocket + Send + Sync>,
        settings: DhtSettings,
        observer: Arc<dyn DhtObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            id,
            family,
            socket,
            observer,
            table_v4: RoutingTable::new(id, settings.clone()),
            table_v6: RoutingTable::new(id, settings.clone()),
            storage: DhtStorage::new(id, settings.clone()),
            tokens: TokenManager::new(now),
            rpc: RpcManager::new(settings.request_timeout),
            traversals: HashMap::new(),
            next_traversal_id: 0,
            blocked: HashMap::new(),
            next_bucket_refresh: now,
            settings,
            clock,
        }
    }

    pub fn nid(&self) -> &NodeId {
        &self.id
    }

    pub fn settings(&self) -> &DhtSettings {
        &self.settings
    }

    /// Size of the routing table for the node's own family.
    pub fn size(&self) -> TableSize {
        self.table(self.family).size()
    }

    pub fn table(&self, family: Family) -> &RoutingTable {
        match family {
            Family::V4 => &self.table_v4,
            Family::V6 => &self.table_v6,
        }
    }

    pub fn table_mut(&mut self, family: Family) -> &mut RoutingTable {
        match family {
            Family::V4 => &mut self.table_v4,
            Family::V6 => &mut self.table_v6,
        }
    }

    /// Re-derives the node ID after the external address changed, and
    /// rebuilds the routing tables around it.
    pub fn update_node_id(&mut self) {
        let new_id = match self.observer.external_address(self.family) {
            Some(ip) => generate_secure_node_id(&ip),
            None => NodeId::generate(),
        };
        info!(old = %self.id, new = %new_id, "updating node id");

        self.id = new_id;
        self.table_v4.update_node_id(new_id);
        self.table_v6.update_node_id(new_id);
        self.storage.update_node_id(new_id);
    }

    /// Abandons every running traversal without invoking callbacks.
    pub fn shutdown(&mut self) {
        for (_, traversal) in self.traversals.drain() {
            self.rpc.cancel(traversal.id);
        }
    }

    // ------------------------------------------------------------------
    // user API
    // ------------------------------------------------------------------

    /// Populates the routing table starting from the given seed
    /// endpoints, then reports how many nodes responded.
    pub fn bootstrap(
        &mut self,
        seeds: Vec<SocketAddr>,
        on_complete: impl FnOnce(usize) + Send + 'static,
    ) {
        for addr in &seeds {
            if Family::of(addr) == self.family {
                self.table_mut(self.family).add_router_node(*addr);
            }
        }

        info!(seeds = seeds.len(), "starting bootstrap");
        let traversal = self.new_traversal(
            self.id,
            TraversalKind::Bootstrap {
                on_complete: Some(Box::new(on_complete)),
            },
        );
        self.start_traversal(traversal);
    }

    /// Looks up peers for an info-hash. `on_peers` fires for every batch
    /// of newly discovered peers, `on_complete` once with the full set.
    pub fn get_peers(
        &mut self,
        info_hash: NodeId,
        on_peers: impl FnMut(&[SocketAddr]) + Send + 'static,
        on_complete: impl FnOnce(Vec<SocketAddr>) + Send + 'static,
    ) {
        let traversal = self.new_traversal(
            info_hash,
            TraversalKind::Peers {
                info_hash,
                announce_port: None,
                seed: false,
                on_peers: Some(Box::new(on_peers)),
                on_complete: Some(Box::new(on_complete)),
                found: Vec::new(),
            },
        );
        self.start_traversal(traversal);
    }

    /// Looks up peers and, on completion, announces our presence to the
    /// closest responders. `port` 0 announces the implied (UDP source)
    /// port.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        port: u16,
        seed: bool,
        on_peers: impl FnMut(&[SocketAddr]) + Send + 'static,
    ) {
        let traversal = self.new_traversal(
            info_hash,
            TraversalKind::Peers {
                info_hash,
                announce_port: Some(port),
                seed,
                on_peers: Some(Box::new(on_peers)),
                on_complete: None,
                found: Vec::new(),
            },
        );
        self.start_traversal(traversal);
    }

    /// Fetches an immutable item by target hash.
    pub fn get_item(
        &mut self,
        target: NodeId,
        on_item: impl FnOnce(Option<Bytes>) + Send + 'static,
    ) {
        let traversal = self.new_traversal(
            target,
            TraversalKind::GetImmutable {
                on_item: Some(Box::new(on_item)),
            },
        );
        self.start_traversal(traversal);
    }

    /// Fetches the highest-sequence mutable item published under a key
    /// and salt.
    pub fn get_mutable_item(
        &mut self,
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: impl Into<Bytes>,
        on_item: impl FnOnce(Option<MutableItem>) + Send + 'static,
    ) {
        let salt = salt.into();
        let target = mutable_target_id(&public_key, &salt);
        let traversal = self.new_traversal(
            target,
            TraversalKind::GetMutable {
                public_key,
                salt,
                best: None,
                on_item: Some(Box::new(on_item)),
            },
        );
        self.start_traversal(traversal);
    }

    /// Stores an immutable item (`value` must be a bencoded form) on the
    /// nodes closest to its hash. `on_done` receives the number of
    /// storing nodes that acknowledged. Returns the item's target.
    pub fn put_item(
        &mut self,
        value: Bytes,
        on_done: impl FnOnce(usize) + Send + 'static,
    ) -> Result<NodeId, crate::dht::DhtError> {
        decode_buf(&value)?;
        if value.len() > MAX_ITEM_LEN {
            return Err(crate::dht::DhtError::ValueTooLarge);
        }

        let target = immutable_target_id(&value);
        let traversal = self.new_traversal(
            target,
            TraversalKind::PutImmutable {
                value,
                on_done: Some(Box::new(on_done)),
            },
        );
        self.start_traversal(traversal);
        Ok(target)
    }

    /// Stores a mutable item. Once the lookup phase finds the closest
    /// nodes, `data` is called with the highest-sequence item discovered
    /// (so the caller can sign above it) and must return the signed item
    /// to store. `cas` makes the write conditional on the stored
    /// sequence number.
    pub fn put_mutable_item(
        &mut self,
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: impl Into<Bytes>,
        cas: Option<u64>,
        data: impl FnOnce(Option<&MutableItem>) -> MutableItem + Send + 'static,
        on_done: impl FnOnce(usize) + Send + 'static,
    ) {
        let salt = salt.into();
        let target = mutable_target_id(&public_key, &salt);
        let traversal = self.new_traversal(
            target,
            TraversalKind::PutMutable {
                public_key,
                salt,
                best: None,
                cas,
                data: Some(Box::new(data)),
                on_done: Some(Box::new(on_done)),
            },
        );
        self.start_traversal(traversal);
    }

    /// Periodic housekeeping: RPC timeouts, token rotation, storage
    /// expiry, quota retries, bucket refresh.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        for entry in self.rpc.expire(now) {
            self.handle_failure(entry);
        }

        let ids: Vec<TraversalId> = self.traversals.keys().copied().collect();
        for id in ids {
            if let Some(traversal) = self.traversals.remove(&id) {
                self.continue_traversal(traversal);
            }
        }

        self.tokens.tick(now);
        self.storage.tick(now);
        self.blocked.retain(|_, until| *until > now);
        self.refresh_stale_bucket(now);
    }

    // ------------------------------------------------------------------
    // traversal engine
    // ------------------------------------------------------------------

    fn new_traversal(&mut self, target: NodeId, kind: TraversalKind) -> Traversal {
        self.next_traversal_id = self.next_traversal_id.wrapping_add(1);
        Traversal::new(
            self.next_traversal_id,
            target,
            kind,
            self.settings.search_branching,
        )
    }

    fn start_traversal(&mut self, mut traversal: Traversal) {
        let k = self.settings.bucket_size;
        let own_id = self.id;

        for entry in self
            .table(self.family)
            .find_node(&traversal.target, false, k * 2)
        {
            if entry.id != own_id {
                traversal.add_candidate(Some(entry.id), entry.addr);
            }
        }
        for addr in self.table(self.family).router_nodes().to_vec() {
            traversal.add_candidate(None, addr);
        }

        self.continue_traversal(traversal);
    }

    /// Sends whatever the branching limit allows, then either completes
    /// the lookup or parks the traversal until the next event.
    fn continue_traversal(&mut self, mut traversal: Traversal) {
        if traversal.done && traversal.write_phase.is_none() {
            self.rpc.cancel(traversal.id);
            return;
        }

        if traversal.write_phase.is_none() {
            self.add_requests(&mut traversal);

            let k = self.settings.bucket_size;
            if traversal.lookup_finished(k) {
                self.finish_lookup(&mut traversal);
                if traversal.write_phase.is_none() {
                    self.rpc.cancel(traversal.id);
                    return;
                }
            }
        }

        self.traversals.insert(traversal.id, traversal);
    }

    fn add_requests(&mut self, traversal: &mut Traversal) {
        let k = self.settings.bucket_size;
        let now = self.clock.now();

        loop {
            let Some(candidate) = traversal.next_candidate(k) else {
                break;
            };
            let addr = candidate.addr;
            let expected_id = candidate.id;

            let mut args = BTreeMap::new();
            args.insert(bkey(b"id"), id_value(&self.id));
            match &traversal.kind {
                TraversalKind::Bootstrap { .. } => {
                    args.insert(bkey(b"target"), id_value(&traversal.target));
                }
                TraversalKind::Peers { info_hash, .. } => {
                    args.insert(bkey(b"info_hash"), id_value(info_hash));
                }
                _ => {
                    args.insert(bkey(b"target"), id_value(&traversal.target));
                }
            }

            let sent = self.rpc.invoke(
                self.socket.as_ref(),
                traversal.kind.query_name(),
                args,
                addr,
                expected_id,
                RpcContext::Traversal(traversal.id),
                self.settings.read_only,
                now,
            );

            match sent {
                Some(_) => {
                    if let Some(candidate) = traversal.candidate_mut(&addr) {
                        candidate.state = CandidateState::Queried;
                    }
                }
                // out of quota; leave the candidate pending and retry on
                // the next tick
                None => break,
            }
        }
    }

    fn traversal_reply(
        &mut self,
        id: TraversalId,
        from: SocketAddr,
        source_id: NodeId,
        msg: &Value,
    ) {
        let Some(mut traversal) = self.traversals.remove(&id) else {
            // completed or cancelled; late replies are dropped
            return;
        };

        let Some(reply) = msg.get(b"r") else {
            self.continue_traversal(traversal);
            return;
        };

        if let Some(candidate) = traversal.candidate_mut(&from) {
            candidate.state = CandidateState::Responded;
            if candidate.id.is_none() {
                candidate.id = Some(source_id);
            }
            if let Some(token) = reply.get_bytes(b"token") {
                candidate.token = Some(token.clone());
            }
        }
        traversal.resort();
        traversal.responses += 1;

        self.merge_nodes(&mut traversal, reply);
        self.harvest_reply(&mut traversal, reply);

        self.continue_traversal(traversal);
    }

    /// Folds a reply's `nodes` / `nodes6` into the candidate set. A
    /// malformed node string invalidates the reply's entire node payload.
    fn merge_nodes(&self, traversal: &mut Traversal, reply: &Value) {
        let mut discovered = Vec::new();

        for family in [Family::V4, Family::V6] {
            if let Some(data) = reply.get_bytes(family.nodes_key()) {
                match message::parse_nodes(data, family) {
                    Some(nodes) => discovered.extend(nodes),
                    None => {
                        debug!("reply with truncated node list, discarding nodes");
                        return;
                    }
                }
            }
        }

        for (id, addr) in discovered {
            if id != self.id {
                traversal.add_candidate(Some(id), addr);
            }
        }
    }

    fn harvest_reply(&mut self, traversal: &mut Traversal, reply: &Value) {
        match &mut traversal.kind {
            TraversalKind::Bootstrap { .. } => {}

            TraversalKind::Peers {
                on_peers, found, ..
            } => {
                let Some(values) = reply.get(b"values").and_then(|v| v.as_list()) else {
                    return;
                };
                let new_peers: Vec<SocketAddr> = values
                    .iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| message::parse_peer(b))
                    .filter(|p| !found.contains(p))
                    .collect();
                if !new_peers.is_empty() {
                    found.extend_from_slice(&new_peers);
                    if let Some(cb) = on_peers.as_mut() {
                        cb(&new_peers);
                    }
                }
            }

            TraversalKind::GetImmutable { on_item } => {
                let Some(value) = reply.get(b"v") else { return };
                let Ok(encoded) = crate::bencode::encode(value) else {
                    return;
                };
                // content-addressed: the first verified hit is the answer
                if immutable_target_id(&encoded) == traversal.target {
                    if let Some(cb) = on_item.take() {
                        cb(Some(Bytes::from(encoded)));
                    }
                    traversal.done = true;
                }
            }

            TraversalKind::GetMutable {
                public_key,
                salt,
                best,
                ..
            }
            | TraversalKind::PutMutable {
                public_key,
                salt,
                best,
                ..
            } => {
                let Some(value) = reply.get(b"v") else { return };
                let (Some(seq), Some(sig)) =
                    (reply.get(b"seq").and_then(|v| v.as_u64()), reply.get_bytes(b"sig"))
                else {
                    return;
                };
                let sig: [u8; SIGNATURE_LEN] = match sig.as_ref().try_into() {
                    Ok(sig) => sig,
                    Err(_) => return,
                };
                let Ok(encoded) = crate::bencode::encode(value) else {
                    return;
                };

                if !item::verify_mutable_item(&encoded, salt, seq, public_key, &sig) {
                    debug!("mutable item with invalid signature, ignoring");
                    return;
                }
                if best.as_ref().map_or(true, |b| seq > b.seq) {
                    *best = Some(MutableItem {
                        value: Bytes::from(encoded),
                        public_key: *public_key,
                        signature: sig,
                        seq,
                        salt: salt.clone(),
                    });
                }
            }

            TraversalKind::PutImmutable { .. } => {}
        }
    }

    fn traversal_failure(&mut self, id: TraversalId, from: SocketAddr) {
        let Some(mut traversal) = self.traversals.remove(&id) else {
            return;
        };
        if let Some(candidate) = traversal.candidate_mut(&from) {
            candidate.state = CandidateState::Failed;
        }
        self.continue_traversal(traversal);
    }

    /// The lookup phase just terminated: fire the terminal callback or
    /// launch the write phase. Runs at most once per traversal.
    fn finish_lookup(&mut self, traversal: &mut Traversal) {
        debug_assert!(!traversal.done);
        traversal.done = true;
        let responses = traversal.responses;

        match &mut traversal.kind {
            TraversalKind::Bootstrap { on_complete } => {
                if let Some(cb) = on_complete.take() {
                    cb(responses);
                }
            }

            TraversalKind::Peers {
                announce_port,
                on_complete,
                found,
                ..
            } => {
                if let Some(cb) = on_complete.take() {
                    cb(found.clone());
                }
                if announce_port.is_some() {
                    self.start_write_phase(traversal);
                }
            }

            TraversalKind::GetImmutable { on_item } => {
                if let Some(cb) = on_item.take() {
                    cb(None);
                }
            }

            TraversalKind::GetMutable { best, on_item, .. } => {
                if let Some(cb) = on_item.take() {
                    cb(best.take());
                }
            }

            TraversalKind::PutImmutable { .. } | TraversalKind::PutMutable { .. } => {
                self.start_write_phase(traversal);
            }
        }
    }

    /// Sends the write query (`announce_peer` or `put`) to the closest
    /// responders that supplied a token.
    fn start_write_phase(&mut self, traversal: &mut Traversal) {
        let k = self.settings.bucket_size;
        let now = self.clock.now();
        let targets = traversal.write_targets(k);

        let (query, base_args): (&str, BTreeMap<Bytes, Value>) = match &mut traversal.kind {
            TraversalKind::Peers {
                info_hash,
                announce_port,
                seed,
                ..
            } => {
                let mut args = BTreeMap::new();
                args.insert(bkey(b"info_hash"), id_value(info_hash));
                let port = announce_port.unwrap_or(0);
                args.insert(bkey(b"port"), Value::Integer(port as i64));
                if port == 0 {
                    args.insert(bkey(b"implied_port"), Value::Integer(1));
                }
                if *seed {
                    args.insert(bkey(b"seed"), Value::Integer(1));
                }
                ("announce_peer", args)
            }

            TraversalKind::PutImmutable { value, .. } => {
                let mut args = BTreeMap::new();
                if let Ok(decoded) = decode_buf(value) {
                    args.insert(bkey(b"v"), decoded);
                }
                ("put", args)
            }

            TraversalKind::PutMutable {
                best, cas, data, ..
            } => {
                let Some(data) = data.take() else {
                    return;
                };
                let item = data(best.as_ref());

                let mut args = BTreeMap::new();
                if let Ok(decoded) = decode_buf(&item.value) {
                    args.insert(bkey(b"v"), decoded);
                }
                args.insert(
                    bkey(b"k"),
                    Value::Bytes(Bytes::copy_from_slice(&item.public_key)),
                );
                args.insert(
                    bkey(b"sig"),
                    Value::Bytes(Bytes::copy_from_slice(&item.signature)),
                );
                args.insert(bkey(b"seq"), Value::Integer(item.seq as i64));
                if !item.salt.is_empty() {
                    args.insert(bkey(b"salt"), Value::Bytes(item.salt.clone()));
                }
                if let Some(cas) = cas {
                    args.insert(bkey(b"cas"), Value::Integer(*cas as i64));
                }
                ("put", args)
            }

            _ => return,
        };

        let mut outstanding = 0;
        for (node_id, addr, token) in targets {
            let mut args = base_args.clone();
            args.insert(bkey(b"id"), id_value(&self.id));
            args.insert(bkey(b"token"), Value::Bytes(token));

            if self
                .rpc
                .invoke(
                    self.socket.as_ref(),
                    query,
                    args,
                    addr,
                    node_id,
                    RpcContext::Write(traversal.id),
                    self.settings.read_only,
                    now,
                )
                .is_some()
            {
                outstanding += 1;
            }
        }

        if outstanding == 0 {
            self.finish_write_phase(traversal, 0);
            return;
        }

        traversal.write_phase = Some(WritePhase {
            outstanding,
            acked: 0,
        });
    }

    fn write_ack(&mut self, id: TraversalId, ok: bool) {
        let Some(mut traversal) = self.traversals.remove(&id) else {
            return;
        };

        let finished = match traversal.write_phase.as_mut() {
            Some(phase) => {
                phase.outstanding -= 1;
                if ok {
                    phase.acked += 1;
                }
                phase.outstanding == 0
            }
            None => false,
        };

        if finished {
            let acked = traversal.write_phase.as_ref().map_or(0, |p| p.acked);
            self.finish_write_phase(&mut traversal, acked);
            return;
        }

        self.traversals.insert(id, traversal);
    }

    fn finish_write_phase(&mut self, traversal: &mut Traversal, acked: usize) {
        match &mut traversal.kind {
            TraversalKind::PutImmutable { on_done, .. }
            | TraversalKind::PutMutable { on_done, .. } => {
                if let Some(cb) = on_done.take() {
                    cb(acked);
                }
            }
            TraversalKind::Peers { info_hash, .. } => {
                debug!(%info_hash, acked, "announce complete");
            }
            _ => {}
        }
    }

    fn refresh_stale_bucket(&mut self, now: Instant) {
        if now < self.next_bucket_refresh {
            return;
        }

        let stale = self
            .table(self.family)
            .stale_buckets(now, BUCKET_REFRESH_INTERVAL);
        let Some(&bucket) = stale.first() else { return };
        self.next_bucket_refresh = now + Duration::from_secs(60);

        let target = self.table(self.family).random_id_in_bucket(bucket);
        debug!(bucket, "refreshing stale bucket");
        let traversal = self.new_traversal(
            target,
            TraversalKind::Bootstrap { on_complete: None },
        );
        self.start_traversal(traversal);
    }

    // ------------------------------------------------------------------
    // inbound dispatch
    // ------------------------------------------------------------------

    /// The external socket entry point: one datagram in, zero or one
    /// datagrams out.
    pub fn incoming(&mut self, packet: &Bytes, from: SocketAddr) {
        let now = self.clock.now();

        if self
            .blocked
            .get(&from.ip())
            .is_some_and(|until| *until > now)
        {
            return;
        }

        let msg = match decode_buf(packet) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%from, %err, "dropping undecodable packet");
                self.blocked
                    .insert(from.ip(), now + self.settings.block_timeout);
                return;
            }
        };

        let Some(tid) = msg.get_bytes(b"t").cloned() else {
            debug!(%from, "message without transaction id");
            return;
        };
        let Some(y) = msg.get(b"y").and_then(|v| v.as_str()) else {
            debug!(%from, "message without type");
            return;
        };

        match y {
            "r" => self.incoming_response(&msg, &tid, from, false),
            "e" => self.incoming_response(&msg, &tid, from, true),
            "q" => self.incoming_query(&msg, &tid, from),
            other => debug!(%from, other, "unknown message type"),
        }
    }

    fn incoming_response(&mut self, msg: &Value, tid: &Bytes, from: SocketAddr, is_error: bool) {
        let now = self.clock.now();
        let Some(pending) = self.rpc.take_match(tid, from) else {
            return;
        };

        if is_error {
            match parse_error_message(msg) {
                Some((code, message)) => {
                    debug!(%from, code, %message, "incoming error reply")
                }
                None => debug!(%from, "incoming error reply (malformed)"),
            }
            self.handle_failure(pending);
            return;
        }

        let source_id = msg
            .get(b"r")
            .and_then(|r| r.get_bytes(b"id"))
            .and_then(|b| NodeId::from_bytes(b).ok());
        let Some(source_id) = source_id else {
            debug!(%from, "reply with missing or malformed id (malformed)");
            self.handle_failure(pending);
            return;
        };

        if pending.expected_id.is_some_and(|expected| expected != source_id) {
            debug!(%from, "reply with unexpected node id");
            self.handle_failure(pending);
            return;
        }

        if self.settings.enforce_node_id && !verify_secure_id(&source_id, &from.ip()) {
            debug!(%from, "reply from node with invalid secure id");
            self.handle_failure(pending);
            return;
        }

        let rtt = now
            .duration_since(pending.sent_at)
            .as_millis()
            .min((RTT_UNKNOWN - 1) as u128) as u16;
        self.table_mut(Family::of(&from))
            .node_seen(source_id, from, rtt, now);

        if let Some(reply) = msg.get(b"r") {
            if let Some(ip) = reply.get_bytes(b"ip").and_then(|b| message::read_endpoint(b)) {
                self.observer.set_external_address(ip.ip(), from.ip());
            }
        }

        match pending.ctx {
            RpcContext::Ping => {}
            RpcContext::Traversal(id) => self.traversal_reply(id, from, source_id, msg),
            RpcContext::Write(id) => self.write_ack(id, true),
        }
    }

    /// A query we sent failed (remote error, timeout, or bogus reply).
    fn handle_failure(&mut self, pending: PendingRequest) {
        if let Some(id) = pending.expected_id {
            self.table_mut(Family::of(&pending.addr))
                .node_failed(&id, &pending.addr);
        }

        match pending.ctx {
            RpcContext::Ping => {}
            RpcContext::Traversal(id) => self.traversal_failure(id, pending.addr),
            RpcContext::Write(id) => self.write_ack(id, false),
        }
    }

    fn incoming_query(&mut self, msg: &Value, tid: &TransactionId, from: SocketAddr) {
        if self.settings.read_only {
            return;
        }
        let now = self.clock.now();

        let keys = match verify_message(msg, PING_DESC) {
            Ok(keys) => keys,
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let query = keys[0].and_then(|v| v.as_str()).unwrap_or_default().to_owned();
        // the descriptor guarantees a 20-byte id
        let sender_id = keys[2]
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
            .unwrap_or(NodeId::ZERO);

        if self.settings.enforce_node_id && !verify_secure_id(&sender_id, &from.ip()) {
            self.reply_error(tid, from, error_code::PROTOCOL, "invalid node ID");
            return;
        }

        // read-only senders opt out of the routing table (BEP-43)
        if msg.get_integer(b"ro") != Some(1) {
            self.table_mut(Family::of(&from))
                .node_seen(sender_id, from, RTT_UNKNOWN, now);
        }

        let args = msg.get(b"a").cloned().unwrap_or(Value::Dict(BTreeMap::new()));

        match query.as_str() {
            "ping" => self.handle_ping(tid, from),
            "find_node" => self.handle_find_node(tid, from, &args),
            "get_peers" => self.handle_get_peers(tid, from, &args),
            "announce_peer" => self.handle_announce_peer(tid, from, &args, now),
            "get" => self.handle_get(tid, from, &args),
            "put" => self.handle_put(tid, from, &args, now),
            _ => {
                debug!(%from, %query, "unknown query");
                self.reply_error(tid, from, error_code::METHOD_UNKNOWN, "unknown message");
            }
        }
    }

    fn handle_ping(&mut self, tid: &TransactionId, from: SocketAddr) {
        let r = self.base_reply(&from);
        self.reply(tid, from, r);
    }

    fn handle_find_node(&mut self, tid: &TransactionId, from: SocketAddr, args: &Value) {
        let target = match verify_message(args, FIND_NODE_DESC) {
            Ok(keys) => keys[0]
                .and_then(|v| v.as_bytes())
                .and_then(|b| NodeId::from_bytes(b).ok()),
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let Some(target) = target else { return };

        let mut r = self.base_reply(&from);
        self.write_nodes_reply(&mut r, &target, args, &from);
        self.reply(tid, from, r);
    }

    fn handle_get_peers(&mut self, tid: &TransactionId, from: SocketAddr, args: &Value) {
        let keys = match verify_message(args, GET_PEERS_DESC) {
            Ok(keys) => keys,
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let Some(info_hash) = keys[0]
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
        else {
            return;
        };
        let scrape = keys[1].and_then(|v| v.as_integer()) == Some(1);

        self.observer.on_get_peers(&info_hash);

        let mut r = self.base_reply(&from);
        r.insert(
            bkey(b"token"),
            Value::Bytes(self.tokens.generate(&from.ip())),
        );
        self.write_nodes_reply(&mut r, &info_hash, args, &from);

        if let Some(found) = self.storage.get_peers(&info_hash, scrape, Family::of(&from)) {
            if let Some(name) = &found.name {
                r.insert(bkey(b"n"), Value::Bytes(name.clone()));
            }
            if scrape {
                if let (Some(seeds), Some(downloaders)) = (&found.seeds, &found.downloaders) {
                    r.insert(
                        bkey(b"BFsd"),
                        Value::Bytes(Bytes::copy_from_slice(seeds.as_bytes())),
                    );
                    r.insert(
                        bkey(b"BFpe"),
                        Value::Bytes(Bytes::copy_from_slice(downloaders.as_bytes())),
                    );
                }
            } else if !found.peers.is_empty() {
                let values = found
                    .peers
                    .iter()
                    .map(|p| Value::Bytes(message::write_peer(p)))
                    .collect();
                r.insert(bkey(b"values"), Value::List(values));
            }
        }

        self.reply(tid, from, r);
    }

    fn handle_announce_peer(
        &mut self,
        tid: &TransactionId,
        from: SocketAddr,
        args: &Value,
        now: Instant,
    ) {
        let keys = match verify_message(args, ANNOUNCE_DESC) {
            Ok(keys) => keys,
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let Some(info_hash) = keys[0]
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
        else {
            return;
        };
        let token = keys[1].and_then(|v| v.as_bytes()).cloned().unwrap_or_default();

        if !self.tokens.verify(&from.ip(), &token) {
            debug!(%from, "rejecting announce with invalid token");
            self.reply_error(tid, from, error_code::PROTOCOL, "invalid token");
            return;
        }

        let implied_port = keys[3].and_then(|v| v.as_integer()).unwrap_or(0) != 0;
        let port = if implied_port {
            from.port()
        } else {
            match keys[2].and_then(|v| v.as_integer()) {
                Some(port) if (1..=0xffff).contains(&port) => port as u16,
                Some(_) => {
                    self.reply_error(tid, from, error_code::PROTOCOL, "invalid value for 'port'");
                    return;
                }
                None => {
                    self.reply_error(tid, from, error_code::PROTOCOL, "missing 'port' key");
                    return;
                }
            }
        };
        let seed = keys[4].and_then(|v| v.as_integer()) == Some(1);
        let name = keys[5].and_then(|v| v.as_bytes()).cloned();

        self.storage
            .announce_peer(info_hash, SocketAddr::new(from.ip(), port), seed, name, now);
        self.observer.on_announce(&info_hash, from.ip(), port);

        let r = self.base_reply(&from);
        self.reply(tid, from, r);
    }

    fn handle_get(&mut self, tid: &TransactionId, from: SocketAddr, args: &Value) {
        let keys = match verify_message(args, GET_DESC) {
            Ok(keys) => keys,
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let Some(target) = keys[0]
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
        else {
            return;
        };
        let seq_floor = keys[1].and_then(|v| v.as_u64());

        let mut r = self.base_reply(&from);
        r.insert(
            bkey(b"token"),
            Value::Bytes(self.tokens.generate(&from.ip())),
        );
        self.write_nodes_reply(&mut r, &target, args, &from);

        if let Some(value) = self.storage.get_immutable(&target) {
            if let Ok(decoded) = decode_buf(value) {
                r.insert(bkey(b"v"), decoded);
            }
        } else if let Some(found) = self.storage.get_mutable(&target, seq_floor) {
            r.insert(bkey(b"seq"), Value::Integer(found.item.seq as i64));
            if !found.conditional {
                if let Ok(decoded) = decode_buf(&found.item.value) {
                    r.insert(bkey(b"v"), decoded);
                }
                r.insert(
                    bkey(b"k"),
                    Value::Bytes(Bytes::copy_from_slice(&found.item.public_key)),
                );
                r.insert(
                    bkey(b"sig"),
                    Value::Bytes(Bytes::copy_from_slice(&found.item.signature)),
                );
            }
        }

        self.reply(tid, from, r);
    }

    fn handle_put(&mut self, tid: &TransactionId, from: SocketAddr, args: &Value, now: Instant) {
        let keys = match verify_message(args, PUT_DESC) {
            Ok(keys) => keys,
            Err(reason) => {
                self.reply_error(tid, from, error_code::PROTOCOL, &reason);
                return;
            }
        };
        let token = keys[0].and_then(|v| v.as_bytes()).cloned().unwrap_or_default();
        let Some(value) = keys[1] else { return };

        if !self.tokens.verify(&from.ip(), &token) {
            debug!(%from, "rejecting put with invalid token");
            self.reply_error(tid, from, error_code::PROTOCOL, "invalid token");
            return;
        }

        let Ok(encoded) = crate::bencode::encode(value) else {
            return;
        };
        if encoded.len() > MAX_ITEM_LEN {
            self.reply_error(
                tid,
                from,
                error_code::MESSAGE_TOO_BIG,
                "message (v field) too big",
            );
            return;
        }

        if let Some(public_key) = keys[2].and_then(|v| v.as_bytes()) {
            // mutable item
            let Some(seq) = keys[4].and_then(|v| v.as_u64()) else {
                self.reply_error(tid, from, error_code::PROTOCOL, "missing 'seq' key");
                return;
            };
            let Some(signature) = keys[3].and_then(|v| v.as_bytes()) else {
                self.reply_error(tid, from, error_code::PROTOCOL, "missing 'sig' key");
                return;
            };
            let salt = keys[5].and_then(|v| v.as_bytes()).cloned().unwrap_or_default();
            if salt.len() > MAX_SALT_LEN {
                self.reply_error(tid, from, error_code::SALT_TOO_BIG, "salt too big");
                return;
            }
            let cas = keys[6].and_then(|v| v.as_u64());

            // the descriptor pinned both lengths
            let (Ok(public_key), Ok(signature)) = (
                <[u8; PUBLIC_KEY_LEN]>::try_from(public_key.as_ref()),
                <[u8; SIGNATURE_LEN]>::try_from(signature.as_ref()),
            ) else {
                return;
            };

            if !item::verify_mutable_item(&encoded, &salt, seq, &public_key, &signature) {
                self.reply_error(tid, from, error_code::INVALID_SIGNATURE, "invalid signature");
                return;
            }

            let item = MutableItem {
                value: Bytes::from(encoded),
                public_key,
                signature,
                seq,
                salt,
            };

            match self.storage.put_mutable(item, cas, now) {
                Ok(()) => {}
                Err(MutablePutError::CasMismatch) => {
                    self.reply_error(tid, from, error_code::CAS_MISMATCH, "CAS hash mismatch");
                    return;
                }
                Err(MutablePutError::LowerSeq) => {
                    self.reply_error(
                        tid,
                        from,
                        error_code::LOWER_SEQ,
                        "lower than existing sequence number",
                    );
                    return;
                }
            }
        } else {
            let target = immutable_target_id(&encoded);
            self.storage.put_immutable(target, Bytes::from(encoded), now);
        }

        let r = self.base_reply(&from);
        self.reply(tid, from, r);
    }

    // ------------------------------------------------------------------
    // reply plumbing
    // ------------------------------------------------------------------

    fn base_reply(&self, from: &SocketAddr) -> BTreeMap<Bytes, Value> {
        let mut r = BTreeMap::new();
        r.insert(bkey(b"id"), id_value(&self.id));
        // our view of the requester's external endpoint (BEP-42)
        r.insert(bkey(b"ip"), Value::Bytes(message::write_endpoint(from)));
        r
    }

    /// Fills `nodes` / `nodes6` according to the request's `want` list,
    /// defaulting to the transport family.
    fn write_nodes_reply(
        &self,
        r: &mut BTreeMap<Bytes, Value>,
        target: &NodeId,
        args: &Value,
        from: &SocketAddr,
    ) {
        let k = self.settings.bucket_size;
        let (want_v4, want_v6) = wanted_families(args, from);

        for (wanted, family) in [(want_v4, Family::V4), (want_v6, Family::V6)] {
            if !wanted {
                continue;
            }
            let entries: Vec<(NodeId, SocketAddr)> = self
                .table(family)
                .find_node(target, false, k)
                .into_iter()
                .map(|e| (e.id, e.addr))
                .collect();
            r.insert(
                Bytes::from_static(family.nodes_key()),
                Value::Bytes(message::write_nodes(&entries, family)),
            );
        }
    }

    fn reply(&self, tid: &TransactionId, to: SocketAddr, r: BTreeMap<Bytes, Value>) {
        self.send_message(message::build_response(tid, r), to);
    }

    fn reply_error(&self, tid: &TransactionId, to: SocketAddr, code: i64, reason: &str) {
        debug!(%to, code, reason, "sending error reply");
        self.send_message(message::build_error(tid, code, reason), to);
    }

    fn send_message(&self, msg: Value, to: SocketAddr) {
        if !self.socket.has_quota() {
            return;
        }
        match crate::bencode::encode(&msg) {
            Ok(packet) => {
                self.socket.send(&packet, to);
            }
            Err(err) => debug!(%err, "failed to encode outgoing message"),
        }
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn parse_error_message(msg: &Value) -> Option<(i64, String)> {
    let list = msg.get(b"e")?.as_list()?;
    let code = list.first()?.as_integer()?;
    let message = list.get(1)?.as_str()?.to_owned();
    Some((code, message))
}

fn wanted_families(args: &Value, from: &SocketAddr) -> (bool, bool) {
    let mut v4 = false;
    let mut v6 = false;

    if let Some(list) = args.get(b"want").and_then(|v| v.as_list()) {
        for entry in list {
            match entry.as_bytes().map(|b| b.as_ref()) {
                Some(b"n4") => v4 = true,
                Some(b"n6") => v6 = true,
                _ => {}
            }
        }
    }

    if !v4 && !v6 {
        match Family::of(from) {
            Family::V4 => v4 = true,
            Family::V6 => v6 = true,
        }
    }
    (v4, v6)
}
