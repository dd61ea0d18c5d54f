use std::fmt;
use std::net::IpAddr;

use rand::Rng as _;

use super::error::DhtError;

/// A 160-bit Kademlia identifier.
///
/// Used both for node IDs and for lookup targets (info-hashes and item
/// targets are 20-byte SHA-1 digests in the same space). Interpreted as
/// a big-endian integer for ordering; closeness is the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; 20]);

    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to another ID.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The distance exponent: index of the most significant set bit of
/// `a XOR b`, or 0 when the IDs are equal.
///
/// Ranges 0..=159; nodes at exponent `e` fall into routing bucket
/// `159 - e`.
pub fn distance_exp(a: &NodeId, b: &NodeId) -> usize {
    let dist = a.distance(b);
    for (i, &byte) in dist.iter().enumerate() {
        if byte != 0 {
            return (19 - i) * 8 + 7 - byte.leading_zeros() as usize;
        }
    }
    0
}

/// The minimum distance exponent from `target` over a set of IDs.
pub fn min_distance_exp(target: &NodeId, ids: &[NodeId]) -> usize {
    ids.iter()
        .map(|id| distance_exp(target, id))
        .min()
        .unwrap_or(0)
}

/// An ID with the `bits` high-order bits set.
pub fn generate_prefix_mask(bits: usize) -> NodeId {
    debug_assert!(bits <= 160);
    let mut mask = [0u8; 20];
    for (i, byte) in mask.iter_mut().enumerate() {
        let remaining = bits.saturating_sub(i * 8);
        *byte = match remaining {
            0 => 0,
            1..=7 => !(0xffu8 >> remaining),
            _ => 0xff,
        };
    }
    NodeId(mask)
}

/// Compares two addresses under a /24 (IPv4) or /64 (IPv6) mask.
///
/// Addresses of different families never compare equal.
pub fn compare_ip_cidr(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            u32::from(*a) >> 8 == u32::from(*b) >> 8
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            u128::from(*a) >> 64 == u128::from(*b) >> 64
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(hex: &str) -> NodeId {
        NodeId::from_bytes(&hex::decode(hex).unwrap()).unwrap()
    }

    #[test]
    fn test_distance_exp_vectors() {
        let cases: &[(&str, &str, usize)] = &[
            (
                "ffffffffffffffffffffffffffffffffffffffff",
                "0000000000000000000000000000000000000000",
                159,
            ),
            (
                "ffffffffffffffffffffffffffffffffffffffff",
                "7fffffffffffffffffffffffffffffffffffffff",
                159,
            ),
            (
                "ffffffffffffffffffffffffffffffffffffffff",
                "ffffffffffffffffffffffffffffffffffffffff",
                0,
            ),
            (
                "ffffffffffffffffffffffffffffffffffffffff",
                "fffffffffffffffffffffffffffffffffffffffe",
                0,
            ),
            (
                "8000000000000000000000000000000000000000",
                "fffffffffffffffffffffffffffffffffffffffe",
                158,
            ),
            (
                "c000000000000000000000000000000000000000",
                "fffffffffffffffffffffffffffffffffffffffe",
                157,
            ),
            (
                "e000000000000000000000000000000000000000",
                "fffffffffffffffffffffffffffffffffffffffe",
                156,
            ),
            (
                "f000000000000000000000000000000000000000",
                "fffffffffffffffffffffffffffffffffffffffe",
                155,
            ),
            (
                "ffff740985723049587230495872304958703294",
                "ffff889043a890f023980f90e203980d090c3840",
                159 - 16,
            ),
        ];

        for (a, b, exp) in cases {
            assert_eq!(distance_exp(&id(a), &id(b)), *exp, "{} {}", a, b);
        }
    }

    #[test]
    fn test_distance_exp_properties() {
        for _ in 0..32 {
            let a = NodeId::generate();
            let b = NodeId::generate();
            let c = NodeId::generate();

            assert_eq!(distance_exp(&a, &a), 0);
            assert_eq!(distance_exp(&a, &b), distance_exp(&b, &a));
            assert!(
                distance_exp(&a, &c)
                    <= distance_exp(&a, &b).max(distance_exp(&b, &c))
            );
        }
    }

    #[test]
    fn test_min_distance_exp() {
        let n1 = id("0000000000000000000000000000000000000002");
        let n2 = id("0000000000000000000000000000000000000004");
        let n3 = id("0000000000000000000000000000000000000008");

        assert_eq!(min_distance_exp(&NodeId::ZERO, &[n1]), 1);
        assert_eq!(min_distance_exp(&NodeId::ZERO, &[n1, n2]), 1);
        assert_eq!(min_distance_exp(&NodeId::ZERO, &[n1, n2, n3]), 1);
        assert_eq!(min_distance_exp(&NodeId::ZERO, &[n3, n2, n2]), 2);
    }

    #[test]
    fn test_generate_prefix_mask() {
        let cases: &[(usize, &str)] = &[
            (0, "0000000000000000000000000000000000000000"),
            (1, "8000000000000000000000000000000000000000"),
            (2, "c000000000000000000000000000000000000000"),
            (11, "ffe0000000000000000000000000000000000000"),
            (17, "ffff800000000000000000000000000000000000"),
            (37, "fffffffff8000000000000000000000000000000"),
            (160, "ffffffffffffffffffffffffffffffffffffffff"),
        ];

        for (bits, expected) in cases {
            assert_eq!(generate_prefix_mask(*bits), id(expected), "{} bits", bits);
        }
    }

    #[test]
    fn test_compare_ip_cidr_v4() {
        let cases: &[(&str, &str, bool)] = &[
            ("10.255.255.0", "10.255.255.255", true),
            ("11.0.0.0", "10.255.255.255", false),
            ("0.0.0.0", "128.255.255.255", false),
            ("0.0.0.0", "127.255.255.255", false),
            ("255.255.255.0", "255.255.255.255", true),
            ("255.254.255.0", "255.255.255.255", false),
            ("0.0.0.0", "0.0.0.0", true),
            ("255.255.255.255", "255.255.255.255", true),
        ];

        for (a, b, expected) in cases {
            let a: IpAddr = a.parse().unwrap();
            let b: IpAddr = b.parse().unwrap();
            assert_eq!(compare_ip_cidr(&a, &b), *expected, "{} {}", a, b);
        }
    }

    #[test]
    fn test_compare_ip_cidr_v6() {
        let cases: &[(&str, &str, bool)] = &[
            ("::1", "::ffff:ffff:ffff:ffff", true),
            ("::2:0:0:0:0", "::1:ffff:ffff:ffff:ffff", false),
            ("7f::", "ff::", false),
            ("ff::", "ff::", true),
            ("::", "::", true),
            (
                "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff",
                "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff",
                true,
            ),
        ];

        for (a, b, expected) in cases {
            let a: IpAddr = a.parse().unwrap();
            let b: IpAddr = b.parse().unwrap();
            assert_eq!(compare_ip_cidr(&a, &b), *expected, "{} {}", a, b);
        }
    }

    #[test]
    fn test_cross_family_never_equal() {
        let a: IpAddr = "0.0.0.1".parse().unwrap();
        let b: IpAddr = "::1".parse().unwrap();
        assert!(!compare_ip_cidr(&a, &b));
    }
}
