//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every state change that must
//! be exclusive is a single conditional `UPDATE`, and the affected-row count
//! tells the caller whether it won.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStats};
use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus, JobType, QueueStats};
use crate::memory::{KnowledgeRecord, KnowledgeType, PreferenceRecord, VerificationStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// 0000-01-01T00:00:00Z and 9999-12-31T23:59:59Z.
const MIN_STORED_SECS: i64 = -62_167_219_200;
const MAX_STORED_SECS: i64 = 253_402_300_799;

/// Canonical timestamp format. Fixed precision keeps lexical order equal to
/// chronological order, which the claim and expiry queries rely on.
///
/// Instants outside four-digit years are clamped: RFC 3339 would render them
/// with a sign and break the ordering.
fn ts(dt: DateTime<Utc>) -> String {
    let secs = dt.timestamp();
    let dt = if secs > MAX_STORED_SECS {
        DateTime::from_timestamp(MAX_STORED_SECS, 999_999_000).unwrap_or(dt)
    } else if secs < MIN_STORED_SECS {
        DateTime::from_timestamp(MIN_STORED_SECS, 0).unwrap_or(dt)
    } else {
        dt
    };
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(ts))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

/// `libsql::FromValue` is not publicly nameable, so column types are routed
/// through this local trait, which delegates straight to `Row::get`.
trait ColValue: Sized {
    fn get_from(row: &libsql::Row, idx: i32) -> libsql::Result<Self>;
}

macro_rules! impl_col_value {
    ($($t:ty),*) => {$(
        impl ColValue for $t {
            fn get_from(row: &libsql::Row, idx: i32) -> libsql::Result<Self> {
                row.get::<$t>(idx)
            }
        }
    )*};
}

impl_col_value!(
    libsql::Value, i32, u32, i64, u64, f64, Vec<u8>, String, bool,
    Option<i32>, Option<u32>, Option<i64>, Option<u64>, Option<f64>,
    Option<Vec<u8>>, Option<String>, Option<bool>
);

fn col<T: ColValue>(row: &libsql::Row, idx: i32, name: &str) -> Result<T, DatabaseError> {
    T::get_from(row, idx)
        .map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

/// Step a multi-row result. Errors surface instead of ending the scan early.
async fn next_row(rows: &mut libsql::Rows, op: &str) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
}

/// Nullable text column.
fn opt_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("uuid '{s}': {e}")))
}

/// `'a', 'b'` list for an `IN` clause. Values come from `JobType::as_str`,
/// never from callers.
fn job_type_list(job_types: &[JobType]) -> String {
    job_types
        .iter()
        .map(|t| format!("'{}'", t.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Row mapping ─────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, job_type, entity_type, entity_id, group_id, user_id, priority, status, input_data, output_data, error, last_error, retry_count, max_retries, dedup_key, created_at, started_at, completed_at, next_eligible_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = col(row, 0, "id")?;
    let job_type: String = col(row, 1, "job_type")?;
    let status: String = col(row, 7, "status")?;
    let input: String = col(row, 8, "input_data")?;
    let output = opt_col(row, 9);
    let retry_count: i64 = col(row, 12, "retry_count")?;
    let max_retries: i64 = col(row, 13, "max_retries")?;
    let created_at: String = col(row, 15, "created_at")?;

    Ok(Job {
        id: parse_uuid(&id)?,
        job_type: job_type
            .parse()
            .map_err(|e: crate::error::JobError| DatabaseError::Serialization(e.to_string()))?,
        entity_type: col(row, 2, "entity_type")?,
        entity_id: col(row, 3, "entity_id")?,
        group_id: col(row, 4, "group_id")?,
        user_id: opt_col(row, 5),
        priority: col::<i64>(row, 6, "priority")? as i32,
        status: status.parse::<JobStatus>().map_err(DatabaseError::Serialization)?,
        input_data: from_json(&input, "input_data")?,
        output_data: output.map(|s| from_json(&s, "output_data")).transpose()?,
        error: opt_col(row, 10),
        last_error: opt_col(row, 11),
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        dedup_key: opt_col(row, 14),
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(&opt_col(row, 16)),
        completed_at: parse_optional_datetime(&opt_col(row, 17)),
        next_eligible_at: parse_optional_datetime(&opt_col(row, 18)),
    })
}

const CACHE_COLUMNS: &str =
    "cache_key, cache_type, payload, created_at, expires_at, hit_count, last_accessed_at";

fn row_to_cache_entry(row: &libsql::Row) -> Result<CacheEntry, DatabaseError> {
    let cache_type: String = col(row, 1, "cache_type")?;
    let payload: String = col(row, 2, "payload")?;
    let created_at: String = col(row, 3, "created_at")?;
    let hit_count: i64 = col(row, 5, "hit_count")?;

    Ok(CacheEntry {
        cache_key: col(row, 0, "cache_key")?,
        cache_type: cache_type.parse().map_err(DatabaseError::Serialization)?,
        payload: from_json(&payload, "payload")?,
        created_at: parse_datetime(&created_at),
        expires_at: parse_optional_datetime(&opt_col(row, 4)),
        hit_count: hit_count.max(0) as u64,
        last_accessed_at: parse_optional_datetime(&opt_col(row, 6)),
    })
}

const PREFERENCE_COLUMNS: &str = "user_id, preferred_tags, preferred_topics, interaction_patterns, confidence_score, sample_size, last_updated, version, applied_observations";

fn row_to_preference(row: &libsql::Row) -> Result<PreferenceRecord, DatabaseError> {
    let tags: String = col(row, 1, "preferred_tags")?;
    let topics: String = col(row, 2, "preferred_topics")?;
    let patterns: String = col(row, 3, "interaction_patterns")?;
    let sample_size: i64 = col(row, 5, "sample_size")?;
    let last_updated: String = col(row, 6, "last_updated")?;
    let applied: String = col(row, 8, "applied_observations")?;

    Ok(PreferenceRecord {
        user_id: col(row, 0, "user_id")?,
        preferred_tags: from_json(&tags, "preferred_tags")?,
        preferred_topics: from_json(&topics, "preferred_topics")?,
        interaction_patterns: from_json(&patterns, "interaction_patterns")?,
        confidence_score: col(row, 4, "confidence_score")?,
        sample_size: sample_size.max(0) as u64,
        last_updated: parse_datetime(&last_updated),
        applied_observations: from_json(&applied, "applied_observations")?,
        version: col(row, 7, "version")?,
    })
}

const KNOWLEDGE_COLUMNS: &str = "id, group_id, dedup_key, knowledge_type, knowledge_data, related_entity_ids, confidence_score, source_event_ids, verification_status, first_observed, last_observed, observation_count, version, applied_observations";

fn row_to_knowledge(row: &libsql::Row) -> Result<KnowledgeRecord, DatabaseError> {
    let id: String = col(row, 0, "id")?;
    let knowledge_type: String = col(row, 3, "knowledge_type")?;
    let data: String = col(row, 4, "knowledge_data")?;
    let related: String = col(row, 5, "related_entity_ids")?;
    let sources: String = col(row, 7, "source_event_ids")?;
    let verification: String = col(row, 8, "verification_status")?;
    let first: String = col(row, 9, "first_observed")?;
    let last: String = col(row, 10, "last_observed")?;
    let count: i64 = col(row, 11, "observation_count")?;
    let applied: String = col(row, 13, "applied_observations")?;

    Ok(KnowledgeRecord {
        id: parse_uuid(&id)?,
        group_id: col(row, 1, "group_id")?,
        dedup_key: col(row, 2, "dedup_key")?,
        knowledge_type: knowledge_type
            .parse()
            .map_err(DatabaseError::Serialization)?,
        knowledge_data: from_json(&data, "knowledge_data")?,
        related_entity_ids: from_json(&related, "related_entity_ids")?,
        confidence_score: col(row, 6, "confidence_score")?,
        source_event_ids: from_json(&sources, "source_event_ids")?,
        verification_status: verification
            .parse()
            .map_err(DatabaseError::Serialization)?,
        first_observed: parse_datetime(&first),
        last_observed: parse_datetime(&last),
        observation_count: count.max(0) as u64,
        applied_observations: from_json(&applied, "applied_observations")?,
        version: col(row, 12, "version")?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) ON CONFLICT(dedup_key) DO NOTHING"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.entity_type.clone(),
                    job.entity_id.clone(),
                    job.group_id.clone(),
                    opt_text_owned(job.user_id.clone()),
                    job.priority as i64,
                    job.status.as_str(),
                    to_json(&job.input_data, "input_data")?,
                    opt_text_owned(
                        job.output_data
                            .as_ref()
                            .map(|v| to_json(v, "output_data"))
                            .transpose()?
                    ),
                    opt_text_owned(job.error.clone()),
                    opt_text_owned(job.last_error.clone()),
                    job.retry_count as i64,
                    job.max_retries as i64,
                    opt_text_owned(job.dedup_key.clone()),
                    ts(job.created_at),
                    opt_ts(job.started_at),
                    opt_ts(job.completed_at),
                    opt_ts(job.next_eligible_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        Ok(inserted > 0)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn get_job_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE dedup_key = ?1"),
                params![dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_dedup_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job_by_dedup_key: {e}"))),
        }
    }

    async fn list_claim_candidates(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        if job_types.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id FROM jobs \
             WHERE status = 'pending' AND job_type IN ({}) \
             AND (next_eligible_at IS NULL OR next_eligible_at <= ?1) \
             ORDER BY priority ASC, created_at ASC, seq ASC LIMIT ?2",
            job_type_list(job_types)
        );
        let mut rows = self
            .conn()
            .query(&sql, params![ts(now), limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_claim_candidates: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_claim_candidates").await? {
            let id: String = col(&row, 0, "id")?;
            ids.push(parse_uuid(&id)?);
        }
        Ok(ids)
    }

    async fn try_claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let now = ts(now);
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'processing', started_at = ?2, next_eligible_at = NULL \
                 WHERE id = ?1 AND status = 'pending' \
                 AND (next_eligible_at IS NULL OR next_eligible_at <= ?2)",
                params![id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim_job: {e}")))?;

        Ok(updated == 1)
    }

    async fn complete_job(
        &self,
        id: Uuid,
        output: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'completed', output_data = ?2, completed_at = ?3, error = NULL \
                 WHERE id = ?1 AND status = 'processing'",
                params![id.to_string(), to_json(output, "output_data")?, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        Ok(updated == 1)
    }

    async fn requeue_job(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        next_eligible_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, \
                 next_eligible_at = ?3, last_error = ?4, started_at = NULL \
                 WHERE id = ?1 AND status = 'processing' AND retry_count = ?2",
                params![
                    id.to_string(),
                    expected_retry_count as i64,
                    ts(next_eligible_at),
                    last_error
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_job: {e}")))?;

        Ok(updated == 1)
    }

    async fn fail_job(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', retry_count = ?3, error = ?4, last_error = ?4, \
                 completed_at = ?5, output_data = NULL \
                 WHERE id = ?1 AND status = 'processing' AND retry_count = ?2",
                params![
                    id.to_string(),
                    expected_retry_count as i64,
                    retry_count as i64,
                    error,
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;

        Ok(updated == 1)
    }

    async fn delete_pending_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_pending_job: {e}")))?;

        Ok(deleted == 1)
    }

    async fn list_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' AND started_at < ?1 ORDER BY started_at ASC"
                ),
                params![ts(started_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_stale_jobs").await? {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn job_counts(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("job_counts: {e}")))?;

        let mut stats = QueueStats::default();
        while let Some(row) = next_row(&mut rows, "job_counts").await? {
            let status: String = col(&row, 0, "status")?;
            let count = col::<i64>(&row, 1, "count")?.max(0) as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(e) => tracing::warn!("job_counts: {e}"),
            }
        }
        Ok(stats)
    }

    // ── Cache ───────────────────────────────────────────────────────

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CACHE_COLUMNS} FROM cache_entries WHERE cache_key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cache_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cache_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cache_entry: {e}"))),
        }
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO cache_entries ({CACHE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(cache_key) DO UPDATE SET \
                     cache_type = excluded.cache_type, payload = excluded.payload, \
                     created_at = excluded.created_at, expires_at = excluded.expires_at, \
                     hit_count = excluded.hit_count, last_accessed_at = excluded.last_accessed_at"
                ),
                params![
                    entry.cache_key.clone(),
                    entry.cache_type.as_str(),
                    to_json(&entry.payload, "payload")?,
                    ts(entry.created_at),
                    opt_ts(entry.expires_at),
                    entry.hit_count as i64,
                    opt_ts(entry.last_accessed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_cache_entry: {e}")))?;

        debug!(cache_key = %entry.cache_key, "Cache entry stored");
        Ok(())
    }

    async fn record_cache_hit(&self, key: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1, last_accessed_at = ?2 WHERE cache_key = ?1",
                params![key, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_cache_hit: {e}")))?;
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_cache_entry: {e}")))?;
        Ok(deleted > 0)
    }

    async fn purge_expired_cache(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_cache: {e}")))?;

        if count > 0 {
            info!(count, "Purged expired cache entries");
        }
        Ok(count as usize)
    }

    async fn cache_stats(&self) -> Result<CacheStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(hit_count), 0) FROM cache_entries",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cache_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(CacheStats {
                entries: col::<i64>(&row, 0, "count")?.max(0) as u64,
                total_hits: col::<i64>(&row, 1, "hits")?.max(0) as u64,
            }),
            _ => Ok(CacheStats::default()),
        }
    }

    // ── Preferences ─────────────────────────────────────────────────

    async fn get_preference(&self, user_id: &str) -> Result<Option<PreferenceRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PREFERENCE_COLUMNS} FROM preferences WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_preference: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_preference(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_preference: {e}"))),
        }
    }

    async fn insert_preference(&self, record: &PreferenceRecord) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO preferences ({PREFERENCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(user_id) DO NOTHING"
                ),
                params![
                    record.user_id.clone(),
                    to_json(&record.preferred_tags, "preferred_tags")?,
                    to_json(&record.preferred_topics, "preferred_topics")?,
                    to_json(&record.interaction_patterns, "interaction_patterns")?,
                    record.confidence_score,
                    record.sample_size as i64,
                    ts(record.last_updated),
                    record.version,
                    to_json(&record.applied_observations, "applied_observations")?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_preference: {e}")))?;

        Ok(inserted > 0)
    }

    async fn update_preference(
        &self,
        record: &PreferenceRecord,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE preferences SET preferred_tags = ?2, preferred_topics = ?3, \
                 interaction_patterns = ?4, confidence_score = ?5, sample_size = ?6, \
                 last_updated = ?7, applied_observations = ?9, version = version + 1 \
                 WHERE user_id = ?1 AND version = ?8",
                params![
                    record.user_id.clone(),
                    to_json(&record.preferred_tags, "preferred_tags")?,
                    to_json(&record.preferred_topics, "preferred_topics")?,
                    to_json(&record.interaction_patterns, "interaction_patterns")?,
                    record.confidence_score,
                    record.sample_size as i64,
                    ts(record.last_updated),
                    expected_version,
                    to_json(&record.applied_observations, "applied_observations")?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_preference: {e}")))?;

        Ok(updated == 1)
    }

    // ── Knowledge ───────────────────────────────────────────────────

    async fn get_knowledge(
        &self,
        group_id: &str,
        dedup_key: &str,
    ) -> Result<Option<KnowledgeRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge WHERE group_id = ?1 AND dedup_key = ?2"
                ),
                params![group_id, dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_knowledge: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_knowledge(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_knowledge: {e}"))),
        }
    }

    async fn get_knowledge_by_id(&self, id: Uuid) -> Result<Option<KnowledgeRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {KNOWLEDGE_COLUMNS} FROM knowledge WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_knowledge_by_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_knowledge(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_knowledge_by_id: {e}"))),
        }
    }

    async fn list_knowledge(
        &self,
        group_id: &str,
        knowledge_type: Option<KnowledgeType>,
    ) -> Result<Vec<KnowledgeRecord>, DatabaseError> {
        let mut rows = match knowledge_type {
            Some(t) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge WHERE group_id = ?1 AND knowledge_type = ?2 \
                         ORDER BY confidence_score DESC, last_observed DESC"
                    ),
                    params![group_id, t.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge WHERE group_id = ?1 \
                         ORDER BY confidence_score DESC, last_observed DESC"
                    ),
                    params![group_id],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_knowledge: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_knowledge").await? {
            match row_to_knowledge(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping knowledge row: {e}"),
            }
        }
        Ok(records)
    }

    async fn insert_knowledge(&self, record: &KnowledgeRecord) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO knowledge ({KNOWLEDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                     ON CONFLICT(group_id, dedup_key) DO NOTHING"
                ),
                params![
                    record.id.to_string(),
                    record.group_id.clone(),
                    record.dedup_key.clone(),
                    record.knowledge_type.as_str(),
                    to_json(&record.knowledge_data, "knowledge_data")?,
                    to_json(&record.related_entity_ids, "related_entity_ids")?,
                    record.confidence_score,
                    to_json(&record.source_event_ids, "source_event_ids")?,
                    record.verification_status.as_str(),
                    ts(record.first_observed),
                    ts(record.last_observed),
                    record.observation_count as i64,
                    record.version,
                    to_json(&record.applied_observations, "applied_observations")?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_knowledge: {e}")))?;

        Ok(inserted > 0)
    }

    async fn update_knowledge(
        &self,
        record: &KnowledgeRecord,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        // verification_status is deliberately absent: only
        // set_knowledge_verification may change it.
        let updated = self
            .conn()
            .execute(
                "UPDATE knowledge SET knowledge_data = ?2, related_entity_ids = ?3, \
                 confidence_score = ?4, source_event_ids = ?5, last_observed = ?6, \
                 observation_count = ?7, applied_observations = ?9, version = version + 1 \
                 WHERE id = ?1 AND version = ?8",
                params![
                    record.id.to_string(),
                    to_json(&record.knowledge_data, "knowledge_data")?,
                    to_json(&record.related_entity_ids, "related_entity_ids")?,
                    record.confidence_score,
                    to_json(&record.source_event_ids, "source_event_ids")?,
                    ts(record.last_observed),
                    record.observation_count as i64,
                    expected_version,
                    to_json(&record.applied_observations, "applied_observations")?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_knowledge: {e}")))?;

        Ok(updated == 1)
    }

    async fn set_knowledge_verification(
        &self,
        id: Uuid,
        status: VerificationStatus,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE knowledge SET verification_status = ?2, version = version + 1 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_knowledge_verification: {e}")))?;

        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheType;
    use crate::jobs::JobSpec;
    use crate::memory::Fact;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_job(job_type: JobType, priority: i32) -> Job {
        Job::from_spec(
            JobSpec::new(job_type, "memory", "m-1", "family-1")
                .with_priority(priority)
                .with_input(json!({"text": "hello"})),
            3,
        )
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_job() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 2);
        assert!(db.insert_job(&job).await.unwrap());

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.job_type, JobType::TagExtraction);
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.input_data, json!({"text": "hello"}));
        assert_eq!(fetched.priority, 2);
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_key_conflict_is_not_inserted() {
        let db = test_db().await;
        let mut first = make_job(JobType::TagExtraction, 5);
        first.dedup_key = Some("evt-1:tag_extraction".into());
        let mut second = make_job(JobType::TagExtraction, 5);
        second.dedup_key = Some("evt-1:tag_extraction".into());

        assert!(db.insert_job(&first).await.unwrap());
        assert!(!db.insert_job(&second).await.unwrap());

        let found = db
            .get_job_by_dedup_key("evt-1:tag_extraction")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn claim_is_conditional() {
        let db = test_db().await;
        let job = make_job(JobType::Embedding, 5);
        db.insert_job(&job).await.unwrap();

        let now = Utc::now();
        assert!(db.try_claim_job(job.id, now).await.unwrap());
        assert!(!db.try_claim_job(job.id, now).await.unwrap());

        let claimed = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn candidates_ordered_and_filtered() {
        let db = test_db().await;
        let low = make_job(JobType::TagExtraction, 5);
        let high = make_job(JobType::TagExtraction, 1);
        let other = make_job(JobType::Embedding, 0);
        for job in [&low, &high, &other] {
            db.insert_job(job).await.unwrap();
        }

        let ids = db
            .list_claim_candidates(&[JobType::TagExtraction], Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![high.id, low.id]);

        assert!(
            db.list_claim_candidates(&[], Utc::now(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn backoff_gate_hides_job() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 5);
        db.insert_job(&job).await.unwrap();
        let now = Utc::now();
        db.try_claim_job(job.id, now).await.unwrap();

        let later = now + chrono::Duration::seconds(30);
        assert!(db.requeue_job(job.id, 0, later, "boom").await.unwrap());

        assert!(
            db.list_claim_candidates(&[JobType::TagExtraction], now, 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(!db.try_claim_job(job.id, now).await.unwrap());

        let ids = db
            .list_claim_candidates(&[JobType::TagExtraction], later, 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![job.id]);

        let requeued = db.get_job(job.id).await.unwrap().unwrap();
        assert!(!requeued.is_claimable_at(now));
        assert!(requeued.is_claimable_at(later));
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("boom"));
        assert!(requeued.error.is_none());
    }

    #[tokio::test]
    async fn requeue_and_fail_guard_on_retry_count() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 5);
        db.insert_job(&job).await.unwrap();
        db.try_claim_job(job.id, Utc::now()).await.unwrap();

        assert!(!db.requeue_job(job.id, 7, Utc::now(), "x").await.unwrap());
        assert!(!db.fail_job(job.id, 7, 8, "x", Utc::now()).await.unwrap());
        assert!(db.fail_job(job.id, 0, 1, "fatal", Utc::now()).await.unwrap());

        let failed = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("fatal"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 5);
        db.insert_job(&job).await.unwrap();

        assert!(!db.complete_job(job.id, &json!({"ok": true}), Utc::now()).await.unwrap());
        db.try_claim_job(job.id, Utc::now()).await.unwrap();
        assert!(db.complete_job(job.id, &json!({"ok": true}), Utc::now()).await.unwrap());

        let done = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.output_data, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn delete_only_pending() {
        let db = test_db().await;
        let pending = make_job(JobType::TagExtraction, 5);
        let claimed = make_job(JobType::TagExtraction, 5);
        db.insert_job(&pending).await.unwrap();
        db.insert_job(&claimed).await.unwrap();
        db.try_claim_job(claimed.id, Utc::now()).await.unwrap();

        assert!(db.delete_pending_job(pending.id).await.unwrap());
        assert!(!db.delete_pending_job(claimed.id).await.unwrap());
    }

    #[tokio::test]
    async fn stale_jobs_and_counts() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 5);
        db.insert_job(&job).await.unwrap();
        db.insert_job(&make_job(JobType::Embedding, 5)).await.unwrap();

        let started = Utc::now() - chrono::Duration::minutes(10);
        db.try_claim_job(job.id, started).await.unwrap();

        let stale = db
            .list_stale_jobs(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, job.id);

        let counts = db.job_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn row_error_mid_scan_is_reported() {
        let db = test_db().await;
        db.conn()
            .execute_batch(
                "CREATE TABLE scan (n INTEGER, doc TEXT);
                 INSERT INTO scan VALUES (1, '{\"a\": 1}'), (2, 'not json');",
            )
            .await
            .unwrap();

        let mut rows = db
            .conn()
            .query("SELECT json_extract(doc, '$.a') FROM scan ORDER BY n", ())
            .await
            .unwrap();
        assert!(next_row(&mut rows, "scan").await.unwrap().is_some());
        let err = next_row(&mut rows, "scan").await.unwrap_err();
        assert!(err.to_string().contains("scan"));
    }

    // ── Cache tests ─────────────────────────────────────────────────

    fn make_entry(key: &str, expires_at: Option<DateTime<Utc>>) -> CacheEntry {
        CacheEntry {
            cache_key: key.into(),
            cache_type: CacheType::Tags,
            payload: json!(["beach", "family"]),
            created_at: Utc::now(),
            expires_at,
            hit_count: 0,
            last_accessed_at: None,
        }
    }

    #[tokio::test]
    async fn cache_put_get_hit() {
        let db = test_db().await;
        db.put_cache_entry(&make_entry("k1", None)).await.unwrap();

        db.record_cache_hit("k1", Utc::now()).await.unwrap();
        db.record_cache_hit("k1", Utc::now()).await.unwrap();

        let entry = db.get_cache_entry("k1").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!(["beach", "family"]));
        assert_eq!(entry.hit_count, 2);
        assert!(entry.last_accessed_at.is_some());
        assert!(entry.expires_at.is_none());

        let stats = db.cache_stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_hits, 2);
    }

    #[tokio::test]
    async fn cache_put_overwrites() {
        let db = test_db().await;
        db.put_cache_entry(&make_entry("k1", None)).await.unwrap();
        let mut replacement = make_entry("k1", None);
        replacement.payload = json!(["ski"]);
        db.put_cache_entry(&replacement).await.unwrap();

        let entry = db.get_cache_entry("k1").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!(["ski"]));
    }

    #[tokio::test]
    async fn cache_purge_expired_keeps_permanent() {
        let db = test_db().await;
        let past = Utc::now() - chrono::Duration::seconds(5);
        let future = Utc::now() + chrono::Duration::hours(1);
        db.put_cache_entry(&make_entry("old", Some(past))).await.unwrap();
        db.put_cache_entry(&make_entry("fresh", Some(future))).await.unwrap();
        db.put_cache_entry(&make_entry("forever", None)).await.unwrap();

        assert_eq!(db.purge_expired_cache(Utc::now()).await.unwrap(), 1);
        assert!(db.get_cache_entry("old").await.unwrap().is_none());
        assert!(db.get_cache_entry("fresh").await.unwrap().is_some());
        assert!(db.get_cache_entry("forever").await.unwrap().is_some());
        assert!(db.delete_cache_entry("forever").await.unwrap());
    }

    #[test]
    fn timestamps_clamped_to_four_digit_years() {
        assert_eq!(ts(DateTime::<Utc>::MAX_UTC), "9999-12-31T23:59:59.999999Z");
        assert_eq!(ts(DateTime::<Utc>::MIN_UTC), "0000-01-01T00:00:00.000000Z");
        assert_eq!(
            parse_datetime(&ts(DateTime::<Utc>::MAX_UTC)).timestamp(),
            MAX_STORED_SECS
        );
    }

    #[tokio::test]
    async fn far_future_instants_keep_ordering() {
        let db = test_db().await;
        let job = make_job(JobType::TagExtraction, 5);
        db.insert_job(&job).await.unwrap();
        let now = Utc::now();
        db.try_claim_job(job.id, now).await.unwrap();
        assert!(
            db.requeue_job(job.id, 0, DateTime::<Utc>::MAX_UTC, "boom")
                .await
                .unwrap()
        );
        assert!(
            db.list_claim_candidates(&[JobType::TagExtraction], now, 10)
                .await
                .unwrap()
                .is_empty()
        );

        db.put_cache_entry(&make_entry("forever-ish", Some(DateTime::<Utc>::MAX_UTC)))
            .await
            .unwrap();
        assert_eq!(db.purge_expired_cache(now).await.unwrap(), 0);
        assert!(db.get_cache_entry("forever-ish").await.unwrap().is_some());
    }

    // ── Preference tests ────────────────────────────────────────────

    #[tokio::test]
    async fn preference_insert_and_cas() {
        let db = test_db().await;
        let mut record = PreferenceRecord::empty("u1");
        record.preferred_topics.insert("travel".into(), 0.8);
        assert!(db.insert_preference(&record).await.unwrap());
        assert!(!db.insert_preference(&record).await.unwrap());

        let mut stored = db.get_preference("u1").await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        stored.sample_size = 4;
        assert!(db.update_preference(&stored, 0).await.unwrap());
        assert!(!db.update_preference(&stored, 0).await.unwrap());

        let reread = db.get_preference("u1").await.unwrap().unwrap();
        assert_eq!(reread.version, 1);
        assert_eq!(reread.sample_size, 4);
        assert_eq!(reread.preferred_topics["travel"], 0.8);
    }

    #[tokio::test]
    async fn applied_observations_persist() {
        let db = test_db().await;
        let mut record = PreferenceRecord::empty("u1");
        record.applied_observations = vec!["job-1#0".into()];
        db.insert_preference(&record).await.unwrap();

        let mut stored = db.get_preference("u1").await.unwrap().unwrap();
        assert_eq!(stored.applied_observations, vec!["job-1#0"]);
        stored.applied_observations.push("job-2#0".into());
        assert!(db.update_preference(&stored, 0).await.unwrap());
        assert_eq!(
            db.get_preference("u1").await.unwrap().unwrap().applied_observations,
            vec!["job-1#0", "job-2#0"]
        );

        let fact = Fact::new(KnowledgeType::General, json!(1), 0.5).observation("job-3#1");
        let knowledge = KnowledgeRecord::first("g1", &fact, Utc::now());
        db.insert_knowledge(&knowledge).await.unwrap();
        let fetched = db.get_knowledge_by_id(knowledge.id).await.unwrap().unwrap();
        assert_eq!(fetched.applied_observations, vec!["job-3#1"]);
    }

    // ── Knowledge tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn knowledge_unique_per_group_and_key() {
        let db = test_db().await;
        let fact = Fact::new(KnowledgeType::General, json!({"a": 1}), 0.5).from_event("e1");
        let record = KnowledgeRecord::first("g1", &fact, Utc::now());
        assert!(db.insert_knowledge(&record).await.unwrap());

        let dup = KnowledgeRecord::first("g1", &fact, Utc::now());
        assert!(!db.insert_knowledge(&dup).await.unwrap());

        let other_group = KnowledgeRecord::first("g2", &fact, Utc::now());
        assert!(db.insert_knowledge(&other_group).await.unwrap());

        let fetched = db.get_knowledge("g1", &fact.dedup_key()).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.source_event_ids, vec!["e1"]);
        assert_eq!(db.list_knowledge("g1", None).await.unwrap().len(), 1);
        assert_eq!(
            db.list_knowledge("g1", Some(KnowledgeType::Sentiment))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn knowledge_update_keeps_verification() {
        let db = test_db().await;
        let fact = Fact::new(KnowledgeType::General, json!("x"), 0.5);
        let record = KnowledgeRecord::first("g1", &fact, Utc::now());
        db.insert_knowledge(&record).await.unwrap();

        assert!(
            db.set_knowledge_verification(record.id, VerificationStatus::Verified)
                .await
                .unwrap()
        );

        let mut stored = db.get_knowledge_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        stored.verification_status = VerificationStatus::Unverified;
        stored.observation_count = 2;
        assert!(db.update_knowledge(&stored, 1).await.unwrap());

        let reread = db.get_knowledge_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(reread.verification_status, VerificationStatus::Verified);
        assert_eq!(reread.observation_count, 2);
    }
}
