//! Cache manager: TTL-aware reads and the get-or-compute pattern.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, CachePolicy, CacheStats, CacheTtl};
use crate::error::DatabaseError;
use crate::store::Database;

/// Memoizes expensive computations in the `cache_entries` table.
///
/// The cache is an optimization only. Concurrent misses on the same key may
/// both run `compute`; the last writer's payload wins, which is fine because
/// keyed computations are deterministic.
pub struct CacheManager {
    store: Arc<dyn Database>,
    policy: CachePolicy,
}

impl CacheManager {
    pub fn new(store: Arc<dyn Database>, policy: CachePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn ttl_for(&self, key: &CacheKey) -> CacheTtl {
        self.policy.ttl_for(key.cache_type())
    }

    /// Look up a live entry. A hit bumps `hit_count` and `last_accessed_at`;
    /// an expired entry is a miss.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, DatabaseError> {
        let now = Utc::now();
        let Some(mut entry) = self.store.get_cache_entry(key.as_str()).await? else {
            debug!(cache_key = %key, "Cache miss");
            return Ok(None);
        };

        if entry.is_expired_at(now) {
            debug!(cache_key = %key, "Cache miss (expired)");
            return Ok(None);
        }

        self.store.record_cache_hit(key.as_str(), now).await?;
        entry.hit_count += 1;
        entry.last_accessed_at = Some(now);
        debug!(cache_key = %key, hit_count = entry.hit_count, "Cache hit");
        Ok(Some(entry))
    }

    /// Store or overwrite an entry.
    pub async fn put(
        &self,
        key: &CacheKey,
        payload: serde_json::Value,
        ttl: CacheTtl,
    ) -> Result<CacheEntry, DatabaseError> {
        let now = Utc::now();
        let entry = CacheEntry {
            cache_key: key.as_str().to_string(),
            cache_type: key.cache_type(),
            payload,
            created_at: now,
            expires_at: ttl.expires_at(now),
            hit_count: 0,
            last_accessed_at: None,
        };
        self.store.put_cache_entry(&entry).await?;
        Ok(entry)
    }

    /// Return the cached payload, or run `compute` and cache its result.
    ///
    /// A failed `compute` is never cached and its error is returned as is.
    /// Storage errors are logged and bypassed.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: CacheTtl,
        compute: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        match self.get(key).await {
            Ok(Some(entry)) => return Ok(entry.payload),
            Ok(None) => {}
            Err(e) => warn!(cache_key = %key, "Cache read failed, computing: {e}"),
        }

        let payload = compute().await?;

        if let Err(e) = self.put(key, payload.clone(), ttl).await {
            warn!(cache_key = %key, "Cache write failed: {e}");
        }
        Ok(payload)
    }

    /// [`get_or_compute`](Self::get_or_compute) with the TTL configured for
    /// the key's cache type.
    pub async fn memoize<F, Fut, E>(&self, key: &CacheKey, compute: F) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        self.get_or_compute(key, self.ttl_for(key), compute).await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, DatabaseError> {
        self.store.delete_cache_entry(key.as_str()).await
    }

    /// Physically remove expired entries.
    pub async fn purge_expired(&self) -> Result<usize, DatabaseError> {
        self.store.purge_expired_cache(Utc::now()).await
    }

    pub async fn stats(&self) -> Result<CacheStats, DatabaseError> {
        self.store.cache_stats().await
    }
}
