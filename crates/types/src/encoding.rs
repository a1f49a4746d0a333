//! Canonical binary encoding.
//!
//! All hashing, signing, gossip and persistence goes through these helpers so
//! that a value has exactly one byte representation. The encoding is bincode
//! with fixed-width little-endian integers; `BTreeMap` keeps map ordering
//! stable.

use crate::Hash;
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

/// Error encoding or decoding a value.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("decoding failed: {0}")]
    Decode(String),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Encode a value to its canonical bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodingError> {
    options()
        .serialize(value)
        .map_err(|e| EncodingError::Encode(e.to_string()))
}

/// Decode a value, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EncodingError> {
    options()
        .deserialize(bytes)
        .map_err(|e| EncodingError::Decode(e.to_string()))
}

/// Decode with an upper bound on the bytes the decoder may allocate.
///
/// Used for untrusted input such as gossip, where a forged length prefix
/// would otherwise trigger a huge allocation.
pub fn decode_with_limit<T: DeserializeOwned>(
    bytes: &[u8],
    limit: u64,
) -> Result<T, EncodingError> {
    options()
        .with_limit(limit)
        .deserialize(bytes)
        .map_err(|e| EncodingError::Decode(e.to_string()))
}

/// Hash of the canonical encoding of `value`.
pub fn hash_value<T: Serialize + ?Sized>(value: &T) -> Hash {
    // In-memory values of workspace types contain no maps with non-string
    // keys or unsized sequences, so bincode serialization cannot fail.
    let bytes = encode(value).expect("in-memory value should be encodable");
    Hash::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(3u32, "three".to_string());
        map.insert(1u32, "one".to_string());
        let bytes = encode(&map).unwrap();
        let decoded: BTreeMap<u32, String> = decode(&bytes).unwrap();
        assert_eq!(map, decoded);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&42u64).unwrap();
        bytes.push(0);
        assert!(decode::<u64>(&bytes).is_err());
    }

    #[test]
    fn test_limit_rejects_oversized_payload() {
        let bytes = encode(&vec![0u8; 1024]).unwrap();
        assert!(decode_with_limit::<Vec<u8>>(&bytes, 64).is_err());
        assert!(decode_with_limit::<Vec<u8>>(&bytes, 4096).is_ok());
    }
}
