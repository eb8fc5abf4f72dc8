//! Content-addressed response cache.
//!
//! Memoizes the results of expensive, deterministic handler computations
//! (mostly external inference calls). Keys are derived from the inputs only,
//! so identical requests always land on the same entry. Expired entries read
//! as misses whether or not the maintenance sweep has evicted them yet.

pub mod key;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use key::{CacheKey, canonical_json, content_hash};
pub use manager::CacheManager;

/// Kind of memoized computation. Each kind carries its own TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Sentiment,
    Tags,
    Embedding,
    MediaAnalysis,
    Generic,
}

impl CacheType {
    pub const ALL: [CacheType; 5] = [
        CacheType::Sentiment,
        CacheType::Tags,
        CacheType::Embedding,
        CacheType::MediaAnalysis,
        CacheType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentiment => "sentiment",
            Self::Tags => "tags",
            Self::Embedding => "embedding",
            Self::MediaAnalysis => "media_analysis",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown cache type '{s}'"))
    }
}

/// How long an entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Expires(Duration),
    /// Content-addressed results never go stale.
    Permanent,
}

impl CacheTtl {
    /// Build from a seconds value where `0` means permanent.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Permanent
        } else {
            Self::Expires(Duration::from_secs(secs))
        }
    }

    /// Absolute expiry for an entry written at `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Expires(ttl) => {
                let ttl = chrono::Duration::from_std(*ttl).unwrap_or(chrono::Duration::MAX);
                Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
            Self::Permanent => None,
        }
    }
}

/// Per-`CacheType` TTL table.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    ttls: HashMap<CacheType, CacheTtl>,
}

impl CachePolicy {
    pub fn ttl_for(&self, cache_type: CacheType) -> CacheTtl {
        self.ttls
            .get(&cache_type)
            .copied()
            .unwrap_or(CacheTtl::Expires(Duration::from_secs(86_400)))
    }

    pub fn with_ttl(mut self, cache_type: CacheType, ttl: CacheTtl) -> Self {
        self.ttls.insert(cache_type, ttl);
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        let ttls = HashMap::from([
            (CacheType::Sentiment, CacheTtl::Expires(Duration::from_secs(3_600))),
            (CacheType::Tags, CacheTtl::Expires(Duration::from_secs(7 * 86_400))),
            (CacheType::Embedding, CacheTtl::Expires(Duration::from_secs(30 * 86_400))),
            (CacheType::MediaAnalysis, CacheTtl::Permanent),
            (CacheType::Generic, CacheTtl::Expires(Duration::from_secs(86_400))),
        ]);
        Self { ttls }
    }
}

/// A memoized computation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub cache_type: CacheType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// `None` for permanent entries.
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Aggregate cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_hits: u64,
}
