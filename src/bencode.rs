//! Bencode encoding and decoding ([BEP-3]).
//!
//! The DHT wire protocol is bencoded dictionaries over UDP. This module
//! provides a [`Value`] tree, a canonical encoder (dictionary keys sorted
//! byte-lexically) and a decoder that slices the input [`bytes::Bytes`]
//! buffer instead of copying byte strings, so a decoded message shares
//! the receive buffer at zero cost.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_buf};
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
