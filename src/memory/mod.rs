//! Three-tier memory: session (ephemeral), preference (per user), knowledge
//! (durable, per group).
//!
//! Preference and knowledge writes are read-modify-write cycles guarded by a
//! compare-and-swap on the row's version, so two concurrent observations for
//! the same key can't lose an update. Different keys never contend.

pub mod knowledge;
pub mod preference;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

pub use knowledge::{
    Fact, KnowledgeRecord, KnowledgeType, PayloadChange, VerificationStatus, fingerprint,
};
pub use preference::{PreferenceRecord, PreferenceSignal, saturating_confidence};
pub use session::SessionStore;

/// CAS retries before giving up on a contended key.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Tunables for the memory tiers.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// `k` in the saturating confidence curve `1 - k/(k+n)`.
    pub confidence_saturation: f64,
    /// TTL for session entries written without an explicit one.
    pub session_ttl: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            confidence_saturation: 1.0,
            session_ttl: Duration::from_secs(1800),
        }
    }
}

pub struct MemoryManager {
    store: Arc<dyn Database>,
    sessions: SessionStore,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn Database>, config: MemoryConfig) -> Self {
        Self {
            store,
            sessions: SessionStore::new(config.session_ttl),
            config,
        }
    }

    // ── Session tier ────────────────────────────────────────────────

    pub async fn set_session(
        &self,
        user_id: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        self.sessions.set(user_id, key, value, ttl).await;
    }

    pub async fn get_session(&self, user_id: &str, key: &str) -> Option<serde_json::Value> {
        self.sessions.get(user_id, key).await
    }

    pub async fn clear_session(&self, user_id: &str) -> bool {
        self.sessions.clear(user_id).await
    }

    pub async fn purge_sessions(&self) -> usize {
        self.sessions.purge_expired().await
    }

    // ── Preference tier ─────────────────────────────────────────────

    /// Fold one observation into the user's preference record. A signal
    /// whose observation ID the record already holds is a no-op.
    pub async fn apply_observation(
        &self,
        user_id: &str,
        signal: &PreferenceSignal,
    ) -> Result<PreferenceRecord, DatabaseError> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let written = match self.store.get_preference(user_id).await? {
                Some(mut record) => {
                    let expected = record.version;
                    if !record.fold(signal, self.config.confidence_saturation, now) {
                        debug!(user_id, observation_id = ?signal.observation_id, "Preference observation already applied");
                        return Ok(record);
                    }
                    if self.store.update_preference(&record, expected).await? {
                        record.version = expected + 1;
                        Some(record)
                    } else {
                        None
                    }
                }
                None => {
                    let mut record = PreferenceRecord::empty(user_id);
                    record.fold(signal, self.config.confidence_saturation, now);
                    self.store
                        .insert_preference(&record)
                        .await?
                        .then_some(record)
                }
            };

            if let Some(record) = written {
                debug!(
                    user_id,
                    sample_size = record.sample_size,
                    confidence = record.confidence_score,
                    "Preference updated"
                );
                return Ok(record);
            }
            debug!(user_id, attempt, "Preference write conflict, retrying");
            tokio::task::yield_now().await;
        }

        Err(DatabaseError::Constraint(format!(
            "preference update for user {user_id} kept conflicting"
        )))
    }

    /// The user's record, or an empty low-confidence one for new users.
    pub async fn get_preferences(&self, user_id: &str) -> Result<PreferenceRecord, DatabaseError> {
        Ok(self
            .store
            .get_preference(user_id)
            .await?
            .unwrap_or_else(|| PreferenceRecord::empty(user_id)))
    }

    // ── Knowledge tier ──────────────────────────────────────────────

    /// Insert a new fact or merge a re-observation of an existing one.
    pub async fn record_fact(
        &self,
        group_id: &str,
        fact: &Fact,
    ) -> Result<KnowledgeRecord, DatabaseError> {
        let dedup_key = fact.dedup_key();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            match self.store.get_knowledge(group_id, &dedup_key).await? {
                Some(mut record) => {
                    let expected = record.version;
                    let previous_confidence = record.confidence_score;
                    let change = record.merge(fact, self.config.confidence_saturation, now);
                    if change == PayloadChange::AlreadyObserved {
                        debug!(group_id, record_id = %record.id, "Knowledge observation already merged");
                        return Ok(record);
                    }
                    if self.store.update_knowledge(&record, expected).await? {
                        record.version = expected + 1;
                        if change == PayloadChange::Replaced {
                            warn!(
                                group_id,
                                record_id = %record.id,
                                dedup_key = %dedup_key,
                                previous_confidence,
                                incoming_confidence = fact.confidence,
                                "Knowledge payload replaced by higher-confidence observation"
                            );
                        }
                        debug!(
                            group_id,
                            record_id = %record.id,
                            observation_count = record.observation_count,
                            "Knowledge merged"
                        );
                        return Ok(record);
                    }
                }
                None => {
                    let record = KnowledgeRecord::first(group_id, fact, now);
                    if self.store.insert_knowledge(&record).await? {
                        debug!(group_id, record_id = %record.id, dedup_key = %dedup_key, "Knowledge recorded");
                        return Ok(record);
                    }
                }
            }
            debug!(group_id, dedup_key = %dedup_key, attempt, "Knowledge write conflict, retrying");
            tokio::task::yield_now().await;
        }

        Err(DatabaseError::Constraint(format!(
            "knowledge update for {group_id}/{dedup_key} kept conflicting"
        )))
    }

    pub async fn get_fact(
        &self,
        group_id: &str,
        dedup_key: &str,
    ) -> Result<Option<KnowledgeRecord>, DatabaseError> {
        self.store.get_knowledge(group_id, dedup_key).await
    }

    pub async fn list_facts(
        &self,
        group_id: &str,
        knowledge_type: Option<KnowledgeType>,
    ) -> Result<Vec<KnowledgeRecord>, DatabaseError> {
        self.store.list_knowledge(group_id, knowledge_type).await
    }

    /// Explicit moderation action; the only way verification status changes.
    pub async fn set_verification(
        &self,
        record_id: Uuid,
        status: VerificationStatus,
    ) -> Result<(), DatabaseError> {
        if self
            .store
            .set_knowledge_verification(record_id, status)
            .await?
        {
            debug!(record_id = %record_id, status = status.as_str(), "Verification status set");
            Ok(())
        } else {
            Err(DatabaseError::NotFound {
                entity: "knowledge".into(),
                id: record_id.to_string(),
            })
        }
    }
}
