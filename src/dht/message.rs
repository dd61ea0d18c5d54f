//! Wire message envelopes and compact encodings ([BEP-5]).
//!
//! Every DHT message is a bencoded dictionary with a transaction ID
//! (`t`), a type (`y`: query, response, or error) and a client tag (`v`).
//! Node and peer endpoints travel in fixed-size packed binary forms.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use super::node_id::NodeId;
use crate::bencode::Value;

/// Opaque transaction identifier; this implementation issues 2-byte IDs.
pub type TransactionId = Bytes;

/// Client tag sent in the `v` key of every message.
pub const CLIENT_TAG: &[u8; 4] = b"RD\x00\x01";

/// Bytes per compact IPv4 node record (20 id + 4 ip + 2 port).
pub const COMPACT_NODE_V4_LEN: usize = 26;
/// Bytes per compact IPv6 node record (20 id + 16 ip + 2 port).
pub const COMPACT_NODE_V6_LEN: usize = 38;

/// Numeric error codes used in `e` replies.
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
    pub const MESSAGE_TOO_BIG: i64 = 205;
    pub const INVALID_SIGNATURE: i64 = 206;
    pub const SALT_TOO_BIG: i64 = 207;
    pub const CAS_MISMATCH: i64 = 301;
    pub const LOWER_SEQ: i64 = 302;
}

/// An address family on the wire; selects the compact encoding and the
/// `nodes` / `nodes6` response key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub(crate) fn node_len(self) -> usize {
        match self {
            Family::V4 => COMPACT_NODE_V4_LEN,
            Family::V6 => COMPACT_NODE_V6_LEN,
        }
    }

    /// The response key node lists of this family are stored under.
    pub(crate) fn nodes_key(self) -> &'static [u8] {
        match self {
            Family::V4 => b"nodes",
            Family::V6 => b"nodes6",
        }
    }
}

pub(crate) fn bkey(key: &'static [u8]) -> Bytes {
    Bytes::from_static(key)
}

/// Builds a query envelope. Read-only nodes tag their queries with
/// `ro: 1`.
pub(crate) fn build_query(
    tid: &TransactionId,
    q: &str,
    args: BTreeMap<Bytes, Value>,
    read_only: bool,
) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(bkey(b"t"), Value::Bytes(tid.clone()));
    dict.insert(bkey(b"y"), Value::string("q"));
    dict.insert(bkey(b"q"), Value::string(q));
    dict.insert(bkey(b"v"), Value::Bytes(Bytes::from_static(CLIENT_TAG)));
    dict.insert(bkey(b"a"), Value::Dict(args));
    if read_only {
        dict.insert(bkey(b"ro"), Value::Integer(1));
    }
    Value::Dict(dict)
}

pub(crate) fn build_response(tid: &TransactionId, r: BTreeMap<Bytes, Value>) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(bkey(b"t"), Value::Bytes(tid.clone()));
    dict.insert(bkey(b"y"), Value::string("r"));
    dict.insert(bkey(b"v"), Value::Bytes(Bytes::from_static(CLIENT_TAG)));
    dict.insert(bkey(b"r"), Value::Dict(r));
    Value::Dict(dict)
}

pub(crate) fn build_error(tid: &TransactionId, code: i64, message: &str) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(bkey(b"t"), Value::Bytes(tid.clone()));
    dict.insert(bkey(b"y"), Value::string("e"));
    dict.insert(bkey(b"v"), Value::Bytes(Bytes::from_static(CLIENT_TAG)));
    dict.insert(
        bkey(b"e"),
        Value::List(vec![Value::Integer(code), Value::string(message)]),
    );
    Value::Dict(dict)
}

/// Packs an endpoint into the compact IP/port form (6 or 18 bytes).
pub fn write_endpoint(addr: &SocketAddr) -> Bytes {
    let mut buf = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    Bytes::from(buf)
}

/// Decodes a compact IP/port (6 or 18 bytes).
pub fn read_endpoint(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Packs nodes of one family into a compact node string. Entries of the
/// other family are skipped.
pub fn write_nodes(nodes: &[(NodeId, SocketAddr)], family: Family) -> Bytes {
    let mut buf = Vec::with_capacity(nodes.len() * family.node_len());
    for (id, addr) in nodes {
        if Family::of(addr) != family {
            continue;
        }
        buf.extend_from_slice(id.as_bytes());
        match addr.ip() {
            IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
        }
        buf.extend_from_slice(&addr.port().to_be_bytes());
    }
    Bytes::from(buf)
}

/// Parses a compact node string.
///
/// A string whose length is not a multiple of the record size is invalid
/// and yields `None`; callers must treat such a reply as carrying no
/// nodes at all.
pub fn parse_nodes(data: &[u8], family: Family) -> Option<Vec<(NodeId, SocketAddr)>> {
    let record = family.node_len();
    if data.len() % record != 0 {
        return None;
    }

    let mut nodes = Vec::with_capacity(data.len() / record);
    for chunk in data.chunks_exact(record) {
        let id = NodeId::from_bytes(&chunk[..20]).ok()?;
        let addr = read_endpoint(&chunk[20..])?;
        nodes.push((id, addr));
    }
    Some(nodes)
}

/// Packs a peer endpoint for a `values` list entry.
pub fn write_peer(addr: &SocketAddr) -> Bytes {
    write_endpoint(addr)
}

/// Decodes one `values` list entry.
pub fn parse_peer(data: &[u8]) -> Option<SocketAddr> {
    read_endpoint(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{decode, encode};

    #[test]
    fn test_endpoint_roundtrip_v4() {
        let addr: SocketAddr = "192.168.1.1:6881".parse().unwrap();
        let packed = write_endpoint(&addr);
        assert_eq!(packed.len(), 6);
        assert_eq!(read_endpoint(&packed), Some(addr));
    }

    #[test]
    fn test_endpoint_roundtrip_v6() {
        let addr: SocketAddr = "[2001:4860::8888]:6881".parse().unwrap();
        let packed = write_endpoint(&addr);
        assert_eq!(packed.len(), 18);
        assert_eq!(read_endpoint(&packed), Some(addr));
    }

    #[test]
    fn test_nodes_roundtrip() {
        let nodes = vec![
            (NodeId([1u8; 20]), "1.2.3.4:1111".parse().unwrap()),
            (NodeId([2u8; 20]), "5.6.7.8:2222".parse().unwrap()),
        ];
        let packed = write_nodes(&nodes, Family::V4);
        assert_eq!(packed.len(), 52);
        assert_eq!(parse_nodes(&packed, Family::V4).unwrap(), nodes);
    }

    #[test]
    fn test_nodes_skips_other_family() {
        let nodes = vec![
            (NodeId([1u8; 20]), "1.2.3.4:1111".parse().unwrap()),
            (NodeId([2u8; 20]), "[::2]:2222".parse().unwrap()),
        ];
        assert_eq!(write_nodes(&nodes, Family::V4).len(), 26);
        assert_eq!(write_nodes(&nodes, Family::V6).len(), 38);
    }

    #[test]
    fn test_short_node_string_rejected() {
        let nodes = vec![(NodeId([1u8; 20]), "1.2.3.4:1111".parse().unwrap())];
        let packed = write_nodes(&nodes, Family::V4);

        assert!(parse_nodes(&packed[1..], Family::V4).is_none());
        assert!(parse_nodes(&packed[..25], Family::V4).is_none());
        // an empty string is a valid encoding of zero nodes
        assert_eq!(parse_nodes(b"", Family::V4), Some(vec![]));
    }

    #[test]
    fn test_query_envelope() {
        let tid = Bytes::from_static(b"aa");
        let mut args = BTreeMap::new();
        args.insert(bkey(b"id"), Value::Bytes(Bytes::from_static(&[7u8; 20])));

        let query = build_query(&tid, "ping", args, false);
        let parsed = decode(&encode(&query).unwrap()).unwrap();

        assert_eq!(parsed.get_bytes(b"t").unwrap().as_ref(), b"aa");
        assert_eq!(parsed.get(b"y").unwrap().as_str(), Some("q"));
        assert_eq!(parsed.get(b"q").unwrap().as_str(), Some("ping"));
        assert!(parsed.get(b"ro").is_none());

        let ro = build_query(&tid, "ping", BTreeMap::new(), true);
        assert_eq!(ro.get_integer(b"ro"), Some(1));
    }

    #[test]
    fn test_error_envelope() {
        let tid = Bytes::from_static(b"bb");
        let err = build_error(&tid, error_code::PROTOCOL, "invalid token");
        let list = err.get(b"e").unwrap().as_list().unwrap();

        assert_eq!(list[0].as_integer(), Some(203));
        assert_eq!(list[1].as_str(), Some("invalid token"));
        assert_eq!(err.get(b"y").unwrap().as_str(), Some("e"));
    }
}
