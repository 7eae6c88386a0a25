//! Content digests: task cache keys and run manifest hashes.
//!
//! Both are BLAKE3 over canonical JSON. `serde_json::Value` keeps object keys
//! sorted, so structurally equal inputs always encode to the same bytes.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Deterministic identity of one task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Digest of the task name, its arguments and the results of its
    /// dependencies (folded in dependency-id order).
    pub fn compute(name: &str, args: &Value, dependency_results: &BTreeMap<String, Value>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"task\0");
        hasher.update(name.as_bytes());
        hasher.update(b"\0args\0");
        hasher.update(args.to_string().as_bytes());
        for (id, result) in dependency_results {
            hasher.update(b"\0dep\0");
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
            hasher.update(result.to_string().as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manifest hash of a run configuration.
pub fn manifest_hash<T: Serialize + ?Sized>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(manifest)?;
    Ok(manifest_hash_bytes(canonical.to_string().as_bytes()))
}

/// Manifest hash of raw bytes (e.g. a config file on disk).
pub fn manifest_hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
