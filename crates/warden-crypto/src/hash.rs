//! Hashing utilities for Warden
//!
//! Audit chains and anchor leaves hash *canonical JSON*: object keys sorted
//! lexicographically, no insignificant whitespace. The encoding does not
//! depend on serde_json's map ordering features.

use crate::{CryptoError, CryptoResult};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `previous_hash` of the first entry in every hash chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Compute SHA-256 hash of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Compute hash of multiple items
pub fn hash_all(items: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item);
    }
    hasher.finalize().into()
}

/// Serialize a value to canonical JSON
pub fn canonical_json<T: Serialize>(value: &T) -> CryptoResult<String> {
    let value =
        serde_json::to_value(value).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> CryptoResult<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_scalar(&Value::String(key.clone()))?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&encode_scalar(scalar)?),
    }
    Ok(())
}

fn encode_scalar(value: &Value) -> CryptoResult<String> {
    serde_json::to_string(value).map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// SHA-256 over a value's canonical JSON
pub fn hash_canonical<T: Serialize>(value: &T) -> CryptoResult<[u8; 32]> {
    Ok(sha256(canonical_json(value)?.as_bytes()))
}

/// Next link of a hash chain: `hex(SHA-256(previous_hash ‖ canonical_json(payload)))`
pub fn chain_hash<T: Serialize>(previous_hash: &str, payload: &T) -> CryptoResult<String> {
    let body = canonical_json(payload)?;
    Ok(hex::encode(hash_all(&[
        previous_hash.as_bytes(),
        body.as_bytes(),
    ])))
}

/// Decode a 32-byte hex digest
pub fn decode_digest(hex_digest: &str) -> CryptoResult<[u8; 32]> {
    let bytes =
        hex::decode(hex_digest).map_err(|e| CryptoError::InvalidDigest(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidDigest("digest must be 32 bytes".to_string()))
}
