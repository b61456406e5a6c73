//! cache entry shape and key canonicalization
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// a (key hash, value) record; `sha` is the hash of the key, never of `val`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub sha: String,
    pub val: Value,
}

impl CacheEntry {
    pub fn new(sha: String, val: Value) -> CacheEntry {
        CacheEntry { sha, val }
    }
}

/// strip characters that are unsafe in file names and identifiers.
///
/// keeps ascii alphanumerics plus `.`, `_` and `-`, then drops leading dots so the
/// result can never name a hidden file or a parent directory. distinct names may
/// collapse to the same sanitized name; that is accepted.
pub fn normalize_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    kept.trim_start_matches('.').to_string()
}

/// hex encoded sha-256 of the canonical (RFC 8785) json form of `key`.
///
/// object members are sorted during canonicalization, so two keys that only differ
/// in field construction order hash identically.
pub fn compute_sha<K: Serialize + ?Sized>(key: &K) -> Result<String, CacheError> {
    let value =
        serde_json::to_value(key).map_err(|e| CacheError::Canonicalize(e.to_string()))?;
    let bytes = serde_json_canonicalizer::to_vec(&value)
        .map_err(|e| CacheError::Canonicalize(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
