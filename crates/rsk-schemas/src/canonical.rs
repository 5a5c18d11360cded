//! Canonical JSON for payload hashing: recursively key-sorted objects,
//! compact separators. The hash must be stable across key orderings of the
//! same input.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
pub fn canonical_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

/// SHA-256 hex digest over the canonical form of `v`.
pub fn payload_hash(v: &Value) -> String {
    let canonical = canonical_json(v);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
