//! Unified `Database` trait: one async interface for all persistence.
//!
//! Every conditional write reports whether it took effect (`bool`) instead of
//! erroring, so callers can implement claim-once and compare-and-swap on top.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStats};
use crate::error::DatabaseError;
use crate::jobs::{Job, JobType, QueueStats};
use crate::memory::{KnowledgeRecord, KnowledgeType, PreferenceRecord, VerificationStatus};

/// Backend-agnostic database trait covering jobs, cache, preferences and knowledge.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a Pending job. Returns `false` if its dedup key already exists.
    async fn insert_job(&self, job: &Job) -> Result<bool, DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    async fn get_job_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Job>, DatabaseError>;

    /// IDs of claimable jobs in dispatch order: priority ascending, then
    /// creation order.
    async fn list_claim_candidates(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    /// Pending → Processing iff the job is still Pending and eligible.
    async fn try_claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Processing → Completed.
    async fn complete_job(
        &self,
        id: Uuid,
        output: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Processing → Pending with a backoff gate, iff `retry_count` still
    /// equals `expected_retry_count`.
    async fn requeue_job(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        next_eligible_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, DatabaseError>;

    /// Processing → Failed, iff `retry_count` still equals
    /// `expected_retry_count`.
    async fn fail_job(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete a job only while it is Pending.
    async fn delete_pending_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Processing jobs whose attempt started before `started_before`.
    async fn list_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    async fn job_counts(&self) -> Result<QueueStats, DatabaseError>;

    // ── Cache ───────────────────────────────────────────────────────

    /// Raw lookup, expired entries included.
    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, DatabaseError>;

    /// Insert or overwrite an entry.
    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), DatabaseError>;

    async fn record_cache_hit(&self, key: &str, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Delete entries with `expires_at <= now`. Returns the number removed.
    async fn purge_expired_cache(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    async fn cache_stats(&self) -> Result<CacheStats, DatabaseError>;

    // ── Preferences ─────────────────────────────────────────────────

    async fn get_preference(&self, user_id: &str) -> Result<Option<PreferenceRecord>, DatabaseError>;

    /// Insert a user's first record. Returns `false` if one already exists.
    async fn insert_preference(&self, record: &PreferenceRecord) -> Result<bool, DatabaseError>;

    /// Overwrite iff the stored version equals `expected_version`; bumps it.
    async fn update_preference(
        &self,
        record: &PreferenceRecord,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    // ── Knowledge ───────────────────────────────────────────────────

    async fn get_knowledge(
        &self,
        group_id: &str,
        dedup_key: &str,
    ) -> Result<Option<KnowledgeRecord>, DatabaseError>;

    async fn get_knowledge_by_id(&self, id: Uuid) -> Result<Option<KnowledgeRecord>, DatabaseError>;

    async fn list_knowledge(
        &self,
        group_id: &str,
        knowledge_type: Option<KnowledgeType>,
    ) -> Result<Vec<KnowledgeRecord>, DatabaseError>;

    /// Insert a new fact. Returns `false` if `(group_id, dedup_key)` exists.
    async fn insert_knowledge(&self, record: &KnowledgeRecord) -> Result<bool, DatabaseError>;

    /// Overwrite iff the stored version equals `expected_version`; bumps it.
    async fn update_knowledge(
        &self,
        record: &KnowledgeRecord,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    async fn set_knowledge_verification(
        &self,
        id: Uuid,
        status: VerificationStatus,
    ) -> Result<bool, DatabaseError>;
}
