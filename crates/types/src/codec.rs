// Path: crates/types/src/codec.rs
//! Canonical serialization for persisted metadata.
//!
//! All structured metadata in the Coordination Store is JSON; the TSO
//! window is raw big-endian bytes and safe points are hex strings. Keeping
//! the encoders here means every component writes byte-identical
//! representations of the same value.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{PdError, Result};

/// Encodes a value as canonical JSON bytes.
pub fn to_json_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| PdError::Internal(format!("json encode: {e}")))
}

/// Decodes a value from JSON bytes, failing fast on malformed data.
pub fn from_json_bytes<T: DeserializeOwned>(b: &[u8]) -> Result<T> {
    serde_json::from_slice(b).map_err(|e| PdError::Internal(format!("json decode: {e}")))
}

/// Encodes a u64 as 8 big-endian bytes.
pub fn u64_to_be_bytes(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// Decodes a u64 from exactly 8 big-endian bytes.
pub fn u64_from_be_bytes(b: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| PdError::Internal(format!("expected 8 bytes, got {}", b.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Encodes a u64 as a fixed-width lowercase hex string.
pub fn u64_to_hex(v: u64) -> String {
    hex::encode(v.to_be_bytes())
}

/// Decodes a u64 from a hex string.
pub fn u64_from_hex(s: &str) -> Result<u64> {
    u64::from_str_radix(s, 16).map_err(|e| PdError::Internal(format!("hex decode {s:?}: {e}")))
}
