//! Short-term memory: per-user session context.
//!
//! Lives only in process memory. Nothing here survives a restart.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Expiry for TTLs too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct SessionEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Key/value entries per user, each with its own expiry.
pub struct SessionStore {
    users: RwLock<HashMap<String, HashMap<String, SessionEntry>>>,
    default_ttl: Duration,
}

impl SessionStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store a value; `ttl = None` uses the default TTL. TTLs past the
    /// representable range are capped at about a century.
    pub async fn set(
        &self,
        user_id: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl.unwrap_or(self.default_ttl))
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), SessionEntry { value, expires_at });
    }

    /// Read a value; expired entries read as absent.
    pub async fn get(&self, user_id: &str, key: &str) -> Option<serde_json::Value> {
        let users = self.users.read().await;
        let entry = users.get(user_id)?.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// All live entries for a user.
    pub async fn snapshot(&self, user_id: &str) -> HashMap<String, serde_json::Value> {
        let now = Instant::now();
        self.users
            .read()
            .await
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.expires_at > now)
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every entry for a user.
    pub async fn clear(&self, user_id: &str) -> bool {
        self.users.write().await.remove(user_id).is_some()
    }

    /// Evict expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut users = self.users.write().await;
        let mut removed = 0;
        for entries in users.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| e.expires_at > now);
            removed += before - entries.len();
        }
        users.retain(|_, entries| !entries.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_and_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.set("u1", "search", json!("paris"), None).await;
        assert_eq!(store.get("u1", "search").await, Some(json!("paris")));
        assert_eq!(store.get("u1", "other").await, None);
        assert_eq!(store.get("u2", "search").await, None);
    }

    #[tokio::test]
    async fn entries_expire_independently() {
        let store = SessionStore::new(Duration::from_secs(60));
        store
            .set("u1", "short", json!(1), Some(Duration::from_millis(20)))
            .await;
        store.set("u1", "long", json!(2), None).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("u1", "short").await, None);
        assert_eq!(store.get("u1", "long").await, Some(json!(2)));
        assert_eq!(store.snapshot("u1").await.len(), 1);
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn overwrite_resets_value_and_ttl() {
        let store = SessionStore::new(Duration::from_secs(60));
        store
            .set("u1", "k", json!("old"), Some(Duration::from_millis(10)))
            .await;
        store.set("u1", "k", json!("new"), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("u1", "k").await, Some(json!("new")));
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let store = SessionStore::new(Duration::MAX);
        store.set("u1", "default", json!(1), None).await;
        store.set("u1", "explicit", json!(2), Some(Duration::MAX)).await;
        assert_eq!(store.get("u1", "default").await, Some(json!(1)));
        assert_eq!(store.get("u1", "explicit").await, Some(json!(2)));
        assert_eq!(store.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn clear_user() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.set("u1", "k", json!(1), None).await;
        assert!(store.clear("u1").await);
        assert!(!store.clear("u1").await);
        assert_eq!(store.get("u1", "k").await, None);
    }
}
