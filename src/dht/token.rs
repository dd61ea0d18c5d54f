//! Write tokens for `announce_peer` and `put`.
//!
//! A token proves the requester recently performed a `get_peers` or
//! `get` from the same IP address. Tokens are `SHA1(secret || ip)` under
//! a rotating secret; the previous secret stays valid for one rotation
//! period so tokens remain usable for 5 to 10 minutes.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tracing::debug;

const SECRET_LEN: usize = 20;

pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct TokenManager {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
    last_rotated: Instant,
}

impl TokenManager {
    pub fn new(now: Instant) -> Self {
        let mut rng = rand::rng();
        let mut current = [0u8; SECRET_LEN];
        let mut previous = [0u8; SECRET_LEN];
        rng.fill(&mut current);
        rng.fill(&mut previous);

        Self {
            current,
            previous,
            last_rotated: now,
        }
    }

    /// Rotates the secrets if a rotation period has elapsed.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_rotated) >= TOKEN_ROTATE_INTERVAL {
            self.rotate(now);
        }
    }

    pub fn rotate(&mut self, now: Instant) {
        self.previous = self.current;
        rand::rng().fill(&mut self.current);
        self.last_rotated = now;
        debug!("rotated write-token secret");
    }

    /// Issues a token for the given source address.
    pub fn generate(&self, ip: &IpAddr) -> Bytes {
        Self::token_for(&self.current, ip)
    }

    /// Accepts tokens issued under the current or the previous secret.
    pub fn verify(&self, ip: &IpAddr, token: &[u8]) -> bool {
        Self::token_for(&self.current, ip).as_ref() == token
            || Self::token_for(&self.previous, ip).as_ref() == token
    }

    fn token_for(secret: &[u8; SECRET_LEN], ip: &IpAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        Bytes::copy_from_slice(&hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_token_binds_address() {
        let manager = TokenManager::new(Instant::now());
        let token = manager.generate(&ip("1.2.3.4"));

        assert_eq!(token.len(), 20);
        assert!(manager.verify(&ip("1.2.3.4"), &token));
        assert!(!manager.verify(&ip("1.2.3.5"), &token));
        assert!(!manager.verify(&ip("1.2.3.4"), b"bogus"));
    }

    #[test]
    fn test_previous_secret_stays_valid_one_rotation() {
        let now = Instant::now();
        let mut manager = TokenManager::new(now);
        let token = manager.generate(&ip("1.2.3.4"));

        manager.rotate(now);
        assert!(manager.verify(&ip("1.2.3.4"), &token));

        manager.rotate(now);
        assert!(!manager.verify(&ip("1.2.3.4"), &token));
    }

    #[test]
    fn test_tick_rotates_after_interval() {
        let now = Instant::now();
        let mut manager = TokenManager::new(now);
        let token = manager.generate(&ip("6.7.8.9"));

        manager.tick(now + Duration::from_secs(1));
        assert_eq!(manager.generate(&ip("6.7.8.9")), token);

        manager.tick(now + TOKEN_ROTATE_INTERVAL);
        assert_ne!(manager.generate(&ip("6.7.8.9")), token);
        // still accepted under the previous secret
        assert!(manager.verify(&ip("6.7.8.9"), &token));
    }
}
