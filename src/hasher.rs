use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Turns a value into a short, filesystem-safe digest.
///
/// Implementations must be deterministic for structurally equal values,
/// within a process and across processes.
pub trait Hasher: fmt::Debug + Send + Sync {
    fn hash(&self, value: &Value) -> CacheResult<String>;

    fn name(&self) -> &'static str;
}

/// Resolves a hasher from its configuration name.
pub fn by_name(name: &str) -> CacheResult<Arc<dyn Hasher>> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" => Ok(Arc::new(Sha256Hasher)),
        other => Err(CacheError::config(format!(
            "unknown hasher `{other}` (expected `sha256`)"
        ))),
    }
}

/// Digest of any serializable value.
pub fn hash_of<T: Serialize + ?Sized>(hasher: &dyn Hasher, value: &T) -> CacheResult<String> {
    let value = serde_json::to_value(value).map_err(CacheError::serialization)?;
    hasher.hash(&value)
}

/// SHA-256 over compact JSON, base-62 encoded.
///
/// `serde_json` keeps object keys sorted, so equal values always serialize
/// to the same bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn hash(&self, value: &Value) -> CacheResult<String> {
        let bytes = serde_json::to_vec(value).map_err(CacheError::serialization)?;
        Ok(base62_encode(&Sha256::digest(&bytes)))
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

/// Encodes `bytes` as one big-endian number in base 62.
pub fn base62_encode(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = bytes.iter().copied().skip_while(|&byte| byte == 0).collect();
    if digits.is_empty() {
        return "0".to_string();
    }

    let mut encoded = Vec::with_capacity(digits.len() * 4 / 3 + 1);
    while !digits.is_empty() {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(digits.len());
        for &byte in &digits {
            let acc = (remainder << 8) | u32::from(byte);
            let digit = acc / 62;
            remainder = acc % 62;
            if !quotient.is_empty() || digit != 0 {
                quotient.push(digit as u8);
            }
        }
        encoded.push(BASE62_ALPHABET[remainder as usize]);
        digits = quotient;
    }

    encoded.iter().rev().map(|&byte| char::from(byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base62_matches_positional_notation() {
        assert_eq!(base62_encode(&[]), "0");
        assert_eq!(base62_encode(&[0, 0]), "0");
        assert_eq!(base62_encode(&[61]), "Z");
        assert_eq!(base62_encode(&[62]), "10");
        assert_eq!(base62_encode(&[1, 0]), "48");
    }

    #[test]
    fn sha256_hash_ignores_object_key_order() -> CacheResult<()> {
        let hasher = Sha256Hasher;
        let left = hasher.hash(&json!({"x": 1, "y": [1, 2]}))?;
        let right = hasher.hash(&json!({"y": [1, 2], "x": 1}))?;
        assert_eq!(left, right);
        assert!(left.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(left, hasher.hash(&json!({"x": 2, "y": [1, 2]}))?);
        Ok(())
    }
}
