//! Immutable and mutable item support ([BEP-44]).
//!
//! Immutable items are addressed by the SHA-1 of their bencoded value.
//! Mutable items are addressed by the SHA-1 of the ed25519 public key
//! (plus salt) and carry a signature over a canonical byte string that
//! binds the value, the salt and a monotonically increasing sequence
//! number.
//!
//! [BEP-44]: http://bittorrent.org/beps/bep_0044.html

use bytes::Bytes;
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};
use sha2::Sha512;

use super::error::DhtError;
use super::node_id::NodeId;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
/// Secret keys are the 64-byte expanded (ref10) form: the clamped scalar
/// followed by the nonce prefix, both halves of `SHA-512(seed)`.
pub const SECRET_KEY_LEN: usize = 64;

/// Upper bound on the bencoded `v` field.
pub const MAX_ITEM_LEN: usize = 1000;
/// Upper bound on the salt.
pub const MAX_SALT_LEN: usize = 64;

/// A signed mutable item as stored and as sent in `put` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    /// The bencoded value.
    pub value: Bytes,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
    pub seq: u64,
    pub salt: Bytes,
}

impl MutableItem {
    pub fn target(&self) -> NodeId {
        mutable_target_id(&self.public_key, &self.salt)
    }

    pub fn verify(&self) -> bool {
        verify_mutable_item(
            &self.value,
            &self.salt,
            self.seq,
            &self.public_key,
            &self.signature,
        )
    }
}

/// The canonical byte string a mutable item's signature covers:
/// `("4:salt" len ":" salt)? "3:seqi" seq "e1:v" value`, where `value`
/// is already bencoded.
pub fn canonical_string(value: &[u8], salt: &[u8], seq: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + salt.len() + 32);
    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(salt.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(salt);
    }
    buf.extend_from_slice(b"3:seqi");
    buf.extend_from_slice(seq.to_string().as_bytes());
    buf.extend_from_slice(b"e1:v");
    buf.extend_from_slice(value);
    buf
}

/// Signs a mutable item with a 64-byte expanded secret key.
pub fn sign_mutable_item(
    value: &[u8],
    salt: &[u8],
    seq: u64,
    public_key: &[u8; PUBLIC_KEY_LEN],
    secret_key: &[u8; SECRET_KEY_LEN],
) -> Result<[u8; SIGNATURE_LEN], DhtError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| DhtError::InvalidPublicKey)?;
    let expanded = ExpandedSecretKey::from_bytes(secret_key);

    let message = canonical_string(value, salt, seq);
    let signature = raw_sign::<Sha512>(&expanded, &message, &verifying_key);
    Ok(signature.to_bytes())
}

/// Verifies a mutable item's signature.
pub fn verify_mutable_item(
    value: &[u8],
    salt: &[u8],
    seq: u64,
    public_key: &[u8; PUBLIC_KEY_LEN],
    signature: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    let message = canonical_string(value, salt, seq);
    verifying_key.verify(&message, &signature).is_ok()
}

/// The target ID of an immutable item: `SHA1(bencoded value)`.
pub fn immutable_target_id(value: &[u8]) -> NodeId {
    let digest = Sha1::digest(value);
    NodeId(digest.into())
}

/// The target ID of a mutable item: `SHA1(public_key || salt)`.
pub fn mutable_target_id(public_key: &[u8; PUBLIC_KEY_LEN], salt: &[u8]) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    hasher.update(salt);
    NodeId(hasher.finalize().into())
}
