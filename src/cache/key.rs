//! Cache key derivation.

use std::fmt;

use sha2::{Digest, Sha256};

use super::CacheType;

/// Version prefix folded into every digest; bump to orphan all old entries.
const KEY_VERSION: &str = "v1";

/// Deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cache_type: CacheType,
    key: String,
}

impl CacheKey {
    /// Derive a key from the canonicalized input, the handler/model
    /// identifier and the parameter set.
    pub fn derive(
        cache_type: CacheType,
        handler_id: &str,
        input: &serde_json::Value,
        params: &serde_json::Value,
    ) -> Self {
        let input = canonical_json(input);
        let params = canonical_json(params);
        let parts: [&str; 5] = [KEY_VERSION, cache_type.as_str(), handler_id, &input, &params];

        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self {
            cache_type,
            key: format!("{}:{}", cache_type, hex::encode(hasher.finalize())),
        }
    }

    /// Key for results that depend only on content bytes (e.g. media analysis).
    pub fn content_addressed(cache_type: CacheType, content_hash: &str) -> Self {
        Self {
            cache_type,
            key: format!("{cache_type}:content:{content_hash}"),
        }
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// SHA-256 of raw bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serialize JSON with object keys sorted at every depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
