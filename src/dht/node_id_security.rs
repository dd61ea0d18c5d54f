//! BEP-42: DHT Security Extension
//!
//! Node IDs are derived from the node's external IP address using CRC32C,
//! limiting how many distinct IDs a single address can occupy and thereby
//! raising the cost of Sybil attacks.
//!
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::Rng;

use super::node_id::NodeId;

/// IPv4 mask applied before hashing.
pub const BEP42_IPV4_MASK: u32 = 0x030f_3fff;

/// IPv6 mask applied to the high 64 bits before hashing.
pub const BEP42_IPV6_MASK: u64 = 0x0103_070f_1f3f_7fff;

/// Derives a node ID from an external IP and a random byte `r`.
///
/// The first 21 bits of the ID are the CRC32C of the masked address mixed
/// with `r & 7`; the last byte stores `r` itself; everything in between
/// is random.
pub fn generate_secure_id(ip: &IpAddr, r: u8) -> NodeId {
    let crc = compute_ip_crc(ip, r);

    let mut id = [0u8; 20];
    rand::rng().fill(&mut id);

    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[19] = r;

    NodeId(id)
}

/// Generates a BEP-42 compliant node ID for the given external address,
/// picking `r` at random. Local-network addresses carry no Sybil risk and
/// get a plain random ID.
pub fn generate_secure_node_id(ip: &IpAddr) -> NodeId {
    if is_local_network(ip) {
        return NodeId::generate();
    }
    generate_secure_id(ip, rand::rng().random())
}

/// Checks that a node ID was derived from the given IP address.
///
/// The first 21 bits must match the CRC32C prefix for the `r` stored in
/// the last byte. Local-network addresses always pass.
pub fn verify_secure_id(id: &NodeId, ip: &IpAddr) -> bool {
    if is_local_network(ip) {
        return true;
    }

    let r = id.0[19];
    let crc = compute_ip_crc(ip, r);

    id.0[0] == (crc >> 24) as u8
        && id.0[1] == (crc >> 16) as u8
        && id.0[2] & 0xf8 == (crc >> 8) as u8 & 0xf8
}

fn compute_ip_crc(ip: &IpAddr, r: u8) -> u32 {
    let r = u32::from(r & 0x07);
    match ip {
        IpAddr::V4(ipv4) => {
            let masked = (u32::from(*ipv4) & BEP42_IPV4_MASK) | (r << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(ipv6) => {
            let octets = ipv6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & BEP42_IPV6_MASK) | (u64::from(r) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Checks if an IP address is in a local/private network range.
///
/// Local networks are exempt from BEP-42 restrictions:
/// - IPv4: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 169.254.0.0/16,
///   127.0.0.0/8
/// - IPv6: loopback, link-local, unique local (fc00::/7)
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_local_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_local_ipv6(ipv6),
    }
}

fn is_local_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    // 10/8, 127/8, 169.254/16, 172.16/12, 192.168/16
    octets[0] == 10
        || octets[0] == 127
        || (octets[0] == 169 && octets[1] == 254)
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

fn is_local_ipv6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();

    ip.is_loopback()
        || segments[0] & 0xffc0 == 0xfe80
        || segments[0] & 0xfe00 == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ipv4_detection() {
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(
            10, 255, 255, 255
        ))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(
            172, 31, 255, 255
        ))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));

        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(172, 32, 0, 1))));
    }

    #[test]
    fn test_local_ipv6_detection() {
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfe80, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfc00, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfd00, 0, 0, 0, 0, 0, 0, 1
        ))));

        assert!(!is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888
        ))));
    }

    #[test]
    fn test_secure_id_vectors() {
        // test vectors from the BEP-42 spec (dht_sec)
        let cases: &[(&str, u8, [u8; 3])] = &[
            ("124.31.75.21", 1, [0x5f, 0xbf, 0xbf]),
            ("21.75.31.124", 86, [0x5a, 0x3c, 0xe9]),
            ("65.23.51.170", 22, [0xa5, 0xd4, 0x32]),
            ("84.124.73.14", 65, [0x1b, 0x03, 0x21]),
            ("43.213.53.83", 90, [0xe5, 0x6f, 0x6c]),
        ];

        for (ip, r, prefix) in cases {
            let ip: IpAddr = ip.parse().unwrap();
            let id = generate_secure_id(&ip, *r);

            assert_eq!(id.0[0], prefix[0], "{}", ip);
            assert_eq!(id.0[1], prefix[1], "{}", ip);
            assert_eq!(id.0[2] & 0xf8, prefix[2] & 0xf8, "{}", ip);
            assert_eq!(id.0[19], *r, "{}", ip);
            assert!(verify_secure_id(&id, &ip));
        }
    }

    #[test]
    fn test_flipped_bits_fail_verification() {
        let ip: IpAddr = "124.31.75.21".parse().unwrap();
        let id = generate_secure_id(&ip, 1);

        // byte 19 must change r & 7 to matter; only the top 5 bits of
        // byte 2 are covered by the prefix
        for (byte, flip) in [(0usize, 0x80u8), (1, 0x80), (2, 0x08), (19, 0x55)] {
            let mut bad = id;
            bad.0[byte] ^= flip;
            assert!(!verify_secure_id(&bad, &ip), "byte {}", byte);
        }
    }

    #[test]
    fn test_validation_fails_for_wrong_ip() {
        let ip1: IpAddr = "124.31.75.21".parse().unwrap();
        let ip2: IpAddr = "8.8.8.8".parse().unwrap();

        let id = generate_secure_node_id(&ip1);
        assert!(verify_secure_id(&id, &ip1));
        assert!(!verify_secure_id(&id, &ip2));
    }

    #[test]
    fn test_local_network_always_valid() {
        let local_ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(verify_secure_id(&NodeId::generate(), &local_ip));
    }

    #[test]
    fn test_v6_roundtrip() {
        let ip: IpAddr = "2001:b829:2123:be84:e16c:d6ae:5290:49f1".parse().unwrap();
        let id = generate_secure_node_id(&ip);
        assert!(verify_secure_id(&id, &ip));
    }
}
