//! Scrape bloom filters ([BEP-33]).
//!
//! A fixed 2048-bit filter with two hash positions per inserted address,
//! used to answer `get_peers` scrape requests with an estimate of the
//! number of seeds and downloaders without shipping the peer lists.
//!
//! [BEP-33]: http://bittorrent.org/beps/bep_0033.html

use std::net::IpAddr;

use sha1::{Digest, Sha1};

const M: usize = 256 * 8;

/// A 256-byte bloom filter with k=2.
///
/// Insertion hashes the raw address bytes with SHA-1 and sets the two bit
/// positions given by the first two 16-bit little-endian words of the
/// digest, each modulo 2048. Bits are numbered LSB-first within a byte,
/// per the BEP-33 reference implementation.
#[derive(Clone)]
pub struct BloomFilter {
    bits: [u8; 256],
}

impl BloomFilter {
    pub const LEN: usize = 256;

    pub fn new() -> Self {
        Self { bits: [0u8; 256] }
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        let mut bits = [0u8; 256];
        bits.copy_from_slice(data);
        Some(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8; 256] {
        &self.bits
    }

    /// Inserts an IP address (4 or 16 raw octets are hashed).
    pub fn insert_ip(&mut self, ip: &IpAddr) {
        let digest = match ip {
            IpAddr::V4(v4) => Sha1::digest(v4.octets()),
            IpAddr::V6(v6) => Sha1::digest(v6.octets()),
        };

        let index1 = (digest[0] as usize | (digest[1] as usize) << 8) % M;
        let index2 = (digest[2] as usize | (digest[3] as usize) << 8) % M;

        self.bits[index1 / 8] |= 1 << (index1 % 8);
        self.bits[index2 / 8] |= 1 << (index2 % 8);
    }

    /// Estimates the number of distinct insertions.
    ///
    /// Uses `ln(c/m) / (k * ln(1 - 1/m))` where `c` is the zero-bit count,
    /// clamped so a saturated filter yields a finite estimate.
    pub fn size(&self) -> f64 {
        let zero_bits: usize = self
            .bits
            .iter()
            .map(|b| b.count_zeros() as usize)
            .sum();
        let c = zero_bits.min(M - 1) as f64;
        let m = M as f64;

        (c / m).ln() / (2.0 * (1.0 - 1.0 / m).ln())
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::new();
        assert_eq!(filter.size() as u32, 0);
    }

    #[test]
    fn test_bep33_vector_v4() {
        // the IPv4-only test vector from BEP-33
        let mut filter = BloomFilter::new();
        for i in 0..=255u8 {
            filter.insert_ip(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, i)));
        }

        assert!((filter.size() - 257.854).abs() < 0.001);
        assert_eq!(
            hex::encode(filter.as_bytes()),
            "24c0004020043000102012743e00480037110820422110008000c0e302854835\
             a05401a4045021302a306c060001881002d8a0a3a8001901b40a800900310008\
             d2108110c2496a0028700010d804188b01415200082004088026411104a80404\
             8002002000080680828c400080cc40020c042c0494447280928041402104080d\
             4240040414a41f0205654800b0811830d2020042b002c5800004a71d0204804a\
             0028120a004c10017801490b834004044106005421000c86900a002050020351\
             0060144e900100924a1018141a028012913f0041802250042280481200002004\
             430804210101c08111c10801001080002038008211004266848606b035001048"
        );
    }

    #[test]
    fn test_bep33_vector_dual_stack() {
        let mut filter = BloomFilter::new();
        for i in 0..=255u8 {
            filter.insert_ip(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, i)));
        }
        for i in 0..0x3e8u16 {
            filter.insert_ip(&IpAddr::V6(Ipv6Addr::new(
                0x2001, 0xdb8, 0, 0, 0, 0, 0, i,
            )));
        }

        assert!((filter.size() - 1224.93).abs() < 0.001);
    }

    #[test]
    fn test_estimate_accuracy_below_half_saturation() {
        // the estimate stays within 5% of the actual cardinality while
        // under half saturation
        for count in [50usize, 200, 400] {
            let mut filter = BloomFilter::new();
            for i in 0..count {
                let ip = Ipv4Addr::new(10, 1, (i >> 8) as u8, (i & 0xff) as u8);
                filter.insert_ip(&IpAddr::V4(ip));
            }
            let estimate = filter.size();
            let error = (estimate - count as f64).abs() / count as f64;
            assert!(error < 0.05, "count {} estimate {}", count, estimate);
        }
    }

    #[test]
    fn test_roundtrip_bytes() {
        let mut filter = BloomFilter::new();
        filter.insert_ip(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));

        let restored = BloomFilter::from_bytes(filter.as_bytes()).unwrap();
        assert_eq!(restored.as_bytes(), filter.as_bytes());
        assert!(BloomFilter::from_bytes(&[0u8; 100]).is_none());
    }
}
