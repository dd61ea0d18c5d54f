//! Iterative closest-node lookups.
//!
//! A traversal keeps a distance-sorted candidate set, queries the
//! closest unqueried candidates with bounded parallelism, and merges
//! nodes discovered in replies back into the set. It completes when the
//! `k` closest candidates have all either responded or failed; requests
//! still in flight toward farther nodes no longer matter at that point.
//!
//! The concrete lookup kinds (bootstrap, peer search, item get/put)
//! differ only in the query they emit and in what they harvest from
//! replies; the node drives them all through this one state machine.

use std::net::SocketAddr;

use bytes::Bytes;

use super::item::MutableItem;
use super::node_id::NodeId;

pub type TraversalId = u32;

/// Bound on the candidate set; pruning only ever drops unqueried tail
/// candidates.
const MAX_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Known but not yet queried.
    Pending,
    /// Query in flight.
    Queried,
    Responded,
    Failed,
}

pub struct Candidate {
    /// Unknown for bootstrap seeds; learned from the reply.
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
    pub state: CandidateState,
    /// Write token carried by a `get_peers` / `get` reply.
    pub token: Option<Bytes>,
}

impl Candidate {
    fn sort_key(&self, target: &NodeId) -> ([u8; 20], Vec<u8>, u16) {
        // unknown-id seeds sort last; ties break toward the lower
        // endpoint tuple
        let distance = match &self.id {
            Some(id) => target.distance(id),
            None => [0xff; 20],
        };
        let ip = match self.addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
            std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        (distance, ip, self.addr.port())
    }
}

/// What a traversal is for. Holds the per-kind harvest and terminal
/// callbacks; the engine state lives in [`Traversal`].
pub enum TraversalKind {
    /// `find_node` toward our own ID (or a bucket refresh target).
    Bootstrap {
        on_complete: Option<Box<dyn FnOnce(usize) + Send>>,
    },
    /// `get_peers`, optionally followed by `announce_peer` to the
    /// closest responders.
    Peers {
        info_hash: NodeId,
        /// `None` for a plain lookup; `Some` announces on completion.
        announce_port: Option<u16>,
        seed: bool,
        on_peers: Option<Box<dyn FnMut(&[SocketAddr]) + Send>>,
        on_complete: Option<Box<dyn FnOnce(Vec<SocketAddr>) + Send>>,
        found: Vec<SocketAddr>,
    },
    /// `get` for an immutable item; completes early on the first
    /// verified value.
    GetImmutable {
        on_item: Option<Box<dyn FnOnce(Option<Bytes>) + Send>>,
    },
    /// `get` for a mutable item; tracks the highest-sequence verified
    /// item seen.
    GetMutable {
        public_key: [u8; 32],
        salt: Bytes,
        best: Option<MutableItem>,
        on_item: Option<Box<dyn FnOnce(Option<MutableItem>) + Send>>,
    },
    /// `get` collecting write tokens, then `put` of an immutable value.
    PutImmutable {
        value: Bytes,
        on_done: Option<Box<dyn FnOnce(usize) + Send>>,
    },
    /// `get` collecting write tokens, then a signed mutable `put`. The
    /// data callback sees the highest-sequence item found so callers can
    /// re-sign above it.
    PutMutable {
        public_key: [u8; 32],
        salt: Bytes,
        best: Option<MutableItem>,
        cas: Option<u64>,
        data: Option<Box<dyn FnOnce(Option<&MutableItem>) -> MutableItem + Send>>,
        on_done: Option<Box<dyn FnOnce(usize) + Send>>,
    },
}

impl TraversalKind {
    /// The wire query this traversal's lookup phase sends.
    pub fn query_name(&self) -> &'static str {
        match self {
            TraversalKind::Bootstrap { .. } => "find_node",
            TraversalKind::Peers { .. } => "get_peers",
            _ => "get",
        }
    }
}

/// Progress of the write phase that follows a completed announce or put
/// lookup.
pub struct WritePhase {
    pub outstanding: usize,
    pub acked: usize,
}

pub struct Traversal {
    pub id: TraversalId,
    pub target: NodeId,
    pub kind: TraversalKind,
    pub candidates: Vec<Candidate>,
    pub branching: usize,
    pub responses: usize,
    /// Set once the lookup phase has terminated; guards the
    /// exactly-once completion step.
    pub done: bool,
    pub write_phase: Option<WritePhase>,
}

impl Traversal {
    pub fn new(id: TraversalId, target: NodeId, kind: TraversalKind, branching: usize) -> Self {
        Self {
            id,
            target,
            kind,
            candidates: Vec::new(),
            branching,
            responses: 0,
            done: false,
            write_phase: None,
        }
    }

    /// Merges a discovered node into the candidate set, keeping it
    /// sorted and deduplicated by ID and by endpoint.
    pub fn add_candidate(&mut self, id: Option<NodeId>, addr: SocketAddr) {
        if self.candidates.iter().any(|c| {
            c.addr == addr || (id.is_some() && c.id == id)
        }) {
            return;
        }

        let candidate = Candidate {
            id,
            addr,
            state: CandidateState::Pending,
            token: None,
        };

        let key = candidate.sort_key(&self.target);
        let pos = self
            .candidates
            .partition_point(|c| c.sort_key(&self.target) <= key);
        self.candidates.insert(pos, candidate);

        if self.candidates.len() > MAX_CANDIDATES {
            // never drop a candidate we have already touched
            if self
                .candidates
                .last()
                .is_some_and(|c| c.state == CandidateState::Pending)
            {
                self.candidates.pop();
            }
        }
    }

    pub fn candidate_mut(&mut self, addr: &SocketAddr) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.addr == *addr)
    }

    /// Restores distance order after a candidate's ID was learned from
    /// its reply (bootstrap seeds start without one).
    pub fn resort(&mut self) {
        let target = self.target;
        self.candidates.sort_by_key(|c| c.sort_key(&target));
    }

    /// The number of queries currently in flight.
    pub fn outstanding(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Queried)
            .count()
    }

    /// Picks the closest pending candidate among the `k` closest
    /// not-failed entries, respecting the branching limit.
    pub fn next_candidate(&mut self, k: usize) -> Option<&mut Candidate> {
        if self.done || self.outstanding() >= self.branching {
            return None;
        }

        let mut considered = 0;
        for candidate in self.candidates.iter_mut() {
            if considered >= k {
                return None;
            }
            match candidate.state {
                CandidateState::Failed => continue,
                CandidateState::Pending => return Some(candidate),
                _ => considered += 1,
            }
        }
        None
    }

    /// The lookup phase is finished when none of the `k` closest
    /// not-failed candidates is pending or in flight.
    pub fn lookup_finished(&self, k: usize) -> bool {
        let mut considered = 0;
        for candidate in &self.candidates {
            if considered >= k {
                break;
            }
            match candidate.state {
                CandidateState::Failed => continue,
                CandidateState::Responded => considered += 1,
                CandidateState::Pending | CandidateState::Queried => return false,
            }
        }
        true
    }

    /// The `k` closest responders that supplied a write token, for the
    /// announce/put phase.
    pub fn write_targets(&self, k: usize) -> Vec<(Option<NodeId>, SocketAddr, Bytes)> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.token.clone().map(|t| (c.id, c.addr, t)))
            .take(k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> NodeId {
        NodeId::ZERO
    }

    fn id(msb: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = msb;
        bytes[19] = 1;
        NodeId(bytes)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    fn traversal(branching: usize) -> Traversal {
        Traversal::new(
            1,
            target(),
            TraversalKind::Bootstrap { on_complete: None },
            branching,
        )
    }

    #[test]
    fn test_candidates_sorted_by_distance() {
        let mut t = traversal(3);
        t.add_candidate(Some(id(8)), addr(1));
        t.add_candidate(Some(id(2)), addr(2));
        t.add_candidate(Some(id(4)), addr(3));
        // unknown ids sort last
        t.add_candidate(None, addr(4));

        let order: Vec<Option<NodeId>> = t.candidates.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![Some(id(2)), Some(id(4)), Some(id(8)), None]);
    }

    #[test]
    fn test_dedup_by_id_and_endpoint() {
        let mut t = traversal(3);
        t.add_candidate(Some(id(1)), addr(1));
        t.add_candidate(Some(id(1)), addr(2));
        t.add_candidate(Some(id(2)), addr(1));
        assert_eq!(t.candidates.len(), 1);
    }

    #[test]
    fn test_branching_limit() {
        let mut t = traversal(2);
        for i in 1..=4 {
            t.add_candidate(Some(id(i)), addr(i as u16));
        }

        t.next_candidate(8).unwrap().state = CandidateState::Queried;
        t.next_candidate(8).unwrap().state = CandidateState::Queried;
        assert!(t.next_candidate(8).is_none());
        assert_eq!(t.outstanding(), 2);

        // a reply frees a slot
        t.candidates[0].state = CandidateState::Responded;
        let next = t.next_candidate(8).unwrap();
        assert_eq!(next.id, Some(id(3)));
    }

    #[test]
    fn test_no_candidate_queried_twice() {
        let mut t = traversal(8);
        t.add_candidate(Some(id(1)), addr(1));

        t.next_candidate(8).unwrap().state = CandidateState::Queried;
        assert!(t.next_candidate(8).is_none());

        t.candidate_mut(&addr(1)).unwrap().state = CandidateState::Responded;
        assert!(t.next_candidate(8).is_none());
    }

    #[test]
    fn test_finished_ignores_outstanding_beyond_k() {
        let mut t = traversal(8);
        // k closest responded, a farther one still in flight
        for i in 1..=3 {
            t.add_candidate(Some(id(i)), addr(i as u16));
            t.candidate_mut(&addr(i as u16)).unwrap().state = CandidateState::Responded;
        }
        t.add_candidate(Some(id(0x80)), addr(9));
        t.candidate_mut(&addr(9)).unwrap().state = CandidateState::Queried;

        assert!(t.lookup_finished(3));
        assert!(!t.lookup_finished(4));
    }

    #[test]
    fn test_failed_candidates_let_farther_ones_count() {
        let mut t = traversal(8);
        t.add_candidate(Some(id(1)), addr(1));
        t.add_candidate(Some(id(2)), addr(2));
        t.candidate_mut(&addr(1)).unwrap().state = CandidateState::Failed;
        t.candidate_mut(&addr(2)).unwrap().state = CandidateState::Responded;

        assert!(t.lookup_finished(1));
    }

    #[test]
    fn test_write_targets_require_token() {
        let mut t = traversal(8);
        for i in 1..=4 {
            t.add_candidate(Some(id(i)), addr(i as u16));
            let c = t.candidate_mut(&addr(i as u16)).unwrap();
            c.state = CandidateState::Responded;
            if i != 2 {
                c.token = Some(Bytes::from_static(b"tok"));
            }
        }

        let targets = t.write_targets(8);
        assert_eq!(targets.len(), 3);
        assert!(targets.iter().all(|(_, a, _)| *a != addr(2)));

        assert_eq!(t.write_targets(2).len(), 2);
    }

    #[test]
    fn test_prune_keeps_touched_candidates() {
        let mut t = traversal(8);
        for i in 0..80 {
            t.add_candidate(Some(id(255 - (i as u8))), addr(1000 + i as u16));
        }
        assert!(t.candidates.len() <= 64);
    }
}
