//! Outgoing request tracking.
//!
//! Every query we send gets a fresh 2-byte transaction ID and a pending
//! entry with a deadline. Replies are matched by transaction ID and
//! validated against the endpoint (and node ID, when known) we sent to.
//! The timer sweep hands expired entries back to their owners.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::message::{self, TransactionId};
use super::node_id::NodeId;
use super::traversal::TraversalId;
use crate::bencode::{encode, Value};

/// What a pending request was sent for; routes the reply, error, or
/// timeout back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcContext {
    /// A lookup query owned by a traversal.
    Traversal(TraversalId),
    /// A write (`announce_peer` / `put`) sent by a traversal's
    /// completion phase.
    Write(TraversalId),
    /// Fire-and-forget housekeeping (e.g. replacement-cache pings).
    Ping,
}

/// A request awaiting its reply.
pub struct PendingRequest {
    pub tid: u16,
    pub addr: SocketAddr,
    /// The node ID we believe lives at `addr`, when known; replies with a
    /// different `id` are treated as failures.
    pub expected_id: Option<NodeId>,
    pub ctx: RpcContext,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// The capability the node uses to put datagrams on the wire.
///
/// `send` is non-blocking; a `false` return (no quota, full socket
/// buffer) drops the packet and the caller retries on a later tick.
pub trait PacketSocket {
    fn has_quota(&self) -> bool;
    fn send(&self, packet: &[u8], addr: SocketAddr) -> bool;
}

pub struct RpcManager {
    pending: HashMap<u16, PendingRequest>,
    next_tid: u16,
    timeout: Duration,
}

impl RpcManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            next_tid: rand::random(),
            timeout,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Sends a query and registers a pending entry for its reply.
    ///
    /// Returns `None` when the socket refused the packet; nothing is
    /// registered in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn invoke(
        &mut self,
        socket: &dyn PacketSocket,
        q: &str,
        args: BTreeMap<Bytes, Value>,
        addr: SocketAddr,
        expected_id: Option<NodeId>,
        ctx: RpcContext,
        read_only: bool,
        now: Instant,
    ) -> Option<u16> {
        if !socket.has_quota() {
            return None;
        }

        let tid = self.allocate_tid();
        let tid_bytes: TransactionId = Bytes::copy_from_slice(&tid.to_be_bytes());
        let query = message::build_query(&tid_bytes, q, args, read_only);

        let packet = match encode(&query) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%err, "failed to encode outgoing query");
                return None;
            }
        };

        if !socket.send(&packet, addr) {
            return None;
        }

        self.pending.insert(
            tid,
            PendingRequest {
                tid,
                addr,
                expected_id,
                ctx,
                sent_at: now,
                deadline: now + self.timeout,
            },
        );
        Some(tid)
    }

    /// Matches an incoming reply's transaction ID against the pending
    /// table and releases the entry.
    ///
    /// A reply from a different endpoint than the one queried does not
    /// consume the entry; the real reply may still arrive.
    pub fn take_match(&mut self, tid: &[u8], from: SocketAddr) -> Option<PendingRequest> {
        let tid = parse_tid(tid)?;

        match self.pending.get(&tid) {
            Some(entry) if entry.addr == from => self.pending.remove(&tid),
            Some(entry) => {
                debug!(
                    expected = %entry.addr,
                    got = %from,
                    "reply from unexpected endpoint, ignoring"
                );
                None
            }
            None => {
                debug!(tid, %from, "reply with unknown transaction id");
                None
            }
        }
    }

    /// Drops every pending entry owned by a cancelled traversal, so late
    /// replies and timer fires stop being delivered to it.
    pub fn cancel(&mut self, traversal: TraversalId) {
        self.pending.retain(|_, entry| {
            !matches!(
                entry.ctx,
                RpcContext::Traversal(t) | RpcContext::Write(t) if t == traversal
            )
        });
    }

    /// Removes and returns every request past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| self.pending.remove(&tid))
            .collect()
    }

    /// Allocates a transaction ID unique among all outstanding requests.
    fn allocate_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }
}

pub fn parse_tid(tid: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = tid.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}
