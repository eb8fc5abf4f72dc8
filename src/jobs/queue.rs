//! Job store and scheduler.
//!
//! `JobQueue` owns the lifecycle rules; the `Database` only knows how to
//! apply a single conditional write. Claiming never holds a lock across the
//! handler call: claim, release, compute, report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::{EnqueueOutcome, Job, JobSpec, JobStatus, JobType, QueueStats};
use crate::store::Database;

/// How many candidates one claim round looks at.
const CLAIM_BATCH: usize = 8;

/// Claim rounds before giving up to other workers.
const MAX_CLAIM_ROUNDS: usize = 4;

/// Re-reads allowed when a concurrent writer bumps `retry_count` under us.
const MAX_FAIL_ATTEMPTS: usize = 8;

/// Error recorded when the recovery sweep reclaims an orphaned job.
pub const DEADLINE_EXCEEDED: &str = "processing deadline exceeded";

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to Pending, not claimable before `next_eligible_at`.
    Retrying {
        retry_count: u32,
        next_eligible_at: DateTime<Utc>,
    },
    /// Terminal.
    Failed { retry_count: u32 },
}

/// Retry budget and backoff applied by [`JobQueue::fail`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry_count`, saturating.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(retry_count))
    }
}

/// Durable priority queue of enrichment jobs.
pub struct JobQueue {
    store: Arc<dyn Database>,
    policy: RetryPolicy,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Database>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Woken on every successful enqueue. Idle workers wait on it.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Create a Pending job.
    ///
    /// A spec whose dedup key already exists is a no-op that returns the
    /// existing job's ID.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueOutcome, JobError> {
        if spec.entity_id.trim().is_empty() {
            return Err(JobError::InvalidSpec {
                reason: format!("{} job has an empty entity_id", spec.job_type),
            });
        }

        if let Some(key) = &spec.dedup_key
            && let Some(existing) = self.store.get_job_by_dedup_key(key).await?
        {
            debug!(
                job_id = %existing.id,
                dedup_key = %key,
                finished = existing.status.is_terminal(),
                "Duplicate enqueue ignored"
            );
            return Ok(EnqueueOutcome::Duplicate(existing.id));
        }

        let job = Job::from_spec(spec, self.policy.max_retries);
        if !self.store.insert_job(&job).await? {
            // Lost an insert race on the dedup key.
            let key = job.dedup_key.as_deref().unwrap_or_default();
            let existing = self.store.get_job_by_dedup_key(key).await?.ok_or_else(|| {
                JobError::Store(crate::error::DatabaseError::Constraint(format!(
                    "job insert for dedup key '{key}' was rejected"
                )))
            })?;
            debug!(job_id = %existing.id, dedup_key = %key, "Duplicate enqueue ignored");
            return Ok(EnqueueOutcome::Duplicate(existing.id));
        }

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            entity_id = %job.entity_id,
            priority = job.priority,
            "Job enqueued"
        );
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Created(job.id))
    }

    /// Claim the most urgent eligible Pending job whose type is in
    /// `capabilities`, moving it to Processing.
    pub async fn claim_next(&self, capabilities: &[JobType]) -> Result<Option<Job>, JobError> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let now = Utc::now();
            let candidates = self
                .store
                .list_claim_candidates(capabilities, now, CLAIM_BATCH)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for id in candidates {
                if self.store.try_claim_job(id, now).await? {
                    let job = self
                        .store
                        .get_job(id)
                        .await?
                        .ok_or(JobError::NotFound { id })?;
                    debug!(job_id = %id, job_type = %job.job_type, "Job claimed");
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    /// Processing → Completed.
    pub async fn complete(&self, id: Uuid, output: serde_json::Value) -> Result<(), JobError> {
        if self.store.complete_job(id, &output, Utc::now()).await? {
            info!(job_id = %id, "Job completed");
            return Ok(());
        }
        Err(self.transition_error(id, JobStatus::Completed).await)
    }

    /// Report a failed attempt. Retries with backoff while budget remains,
    /// otherwise marks the job Failed.
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<FailOutcome, JobError> {
        for _ in 0..MAX_FAIL_ATTEMPTS {
            let job = self
                .store
                .get_job(id)
                .await?
                .ok_or(JobError::NotFound { id })?;
            if !job.status.can_transition_to(JobStatus::Failed) {
                return Err(JobError::InvalidTransition {
                    id,
                    state: job.status.to_string(),
                    target: JobStatus::Failed.to_string(),
                });
            }

            let now = Utc::now();
            let retry_count = job.retry_count.saturating_add(1).min(job.max_retries);

            if retry_count < job.max_retries {
                let delay = chrono::Duration::from_std(self.policy.backoff_delay(job.retry_count))
                    .unwrap_or(chrono::Duration::MAX);
                let next_eligible_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                if self
                    .store
                    .requeue_job(id, job.retry_count, next_eligible_at, reason)
                    .await?
                {
                    warn!(
                        job_id = %id,
                        job_type = %job.job_type,
                        retry_count,
                        max_retries = job.max_retries,
                        next_eligible_at = %next_eligible_at,
                        error = %reason,
                        "Job failed, retry scheduled"
                    );
                    return Ok(FailOutcome::Retrying {
                        retry_count,
                        next_eligible_at,
                    });
                }
            } else if self
                .store
                .fail_job(id, job.retry_count, retry_count, reason, now)
                .await?
            {
                let exhausted = JobError::ExhaustedRetries {
                    id,
                    max_retries: job.max_retries,
                    reason: reason.to_string(),
                };
                error!(job_id = %id, job_type = %job.job_type, retry_count, "{exhausted}");
                return Ok(FailOutcome::Failed { retry_count });
            }
        }

        Err(self.transition_error(id, JobStatus::Failed).await)
    }

    /// Whether `job` is still held by the claim it was handed out under.
    ///
    /// False once the recovery sweep or another report has moved the job on,
    /// including when it was re-claimed since: `started_at` is the claim token.
    pub async fn still_claimed(&self, job: &Job) -> Result<bool, JobError> {
        let Some(current) = self.store.get_job(job.id).await? else {
            return Ok(false);
        };
        Ok(current.status.can_transition_to(JobStatus::Completed)
            && current.started_at == job.started_at)
    }

    /// Abandon a job that has not been claimed yet.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, JobError> {
        let deleted = self.store.delete_pending_job(id).await?;
        if deleted {
            info!(job_id = %id, "Job cancelled");
        }
        Ok(deleted)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.store.get_job(id).await?)
    }

    /// Push Processing jobs older than `max_processing` through `fail`.
    /// Returns how many were reclaimed.
    pub async fn recover_stale(&self, max_processing: Duration) -> Result<usize, JobError> {
        let deadline = chrono::Duration::from_std(max_processing).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(deadline)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut recovered = 0;
        for job in self.store.list_stale_jobs(cutoff).await? {
            match self.fail(job.id, DEADLINE_EXCEEDED).await {
                Ok(outcome) => {
                    warn!(job_id = %job.id, job_type = %job.job_type, ?outcome, "Reclaimed stale job");
                    recovered += 1;
                }
                // Finished between the scan and the fail.
                Err(JobError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats, JobError> {
        Ok(self.store.job_counts().await?)
    }

    async fn transition_error(&self, id: Uuid, target: JobStatus) -> JobError {
        match self.store.get_job(id).await {
            Ok(Some(job)) => JobError::InvalidTransition {
                id,
                state: job.status.to_string(),
                target: target.to_string(),
            },
            Ok(None) => JobError::NotFound { id },
            Err(e) => JobError::Store(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn test_queue(max_retries: u32) -> Arc<JobQueue> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        Arc::new(JobQueue::new(
            Arc::new(db),
            RetryPolicy {
                max_retries,
                backoff_base: Duration::ZERO,
            },
        ))
    }

    fn spec(entity_id: &str) -> JobSpec {
        JobSpec::new(JobType::TagExtraction, "memory", entity_id, "family-1")
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_entity() {
        let queue = test_queue(3).await;
        let err = queue.enqueue(spec("  ")).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn unknown_job_type_is_invalid_spec() {
        let err = "summon_dragon".parse::<JobType>().unwrap_err();
        assert!(matches!(err, JobError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn duplicate_dedup_key_is_noop() {
        let queue = test_queue(3).await;
        let first = queue
            .enqueue(spec("m1").with_dedup_key("evt-1:tag_extraction"))
            .await
            .unwrap();
        let second = queue
            .enqueue(spec("m1").with_dedup_key("evt-1:tag_extraction"))
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let queue = test_queue(3).await;
        let b = queue.enqueue(spec("b").with_priority(5)).await.unwrap().id();
        let a = queue.enqueue(spec("a").with_priority(1)).await.unwrap().id();
        let c = queue.enqueue(spec("c").with_priority(5)).await.unwrap().id();

        let caps = [JobType::TagExtraction];
        let order: Vec<Uuid> = vec![
            queue.claim_next(&caps).await.unwrap().unwrap().id,
            queue.claim_next(&caps).await.unwrap().unwrap().id,
            queue.claim_next(&caps).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![a, b, c]);
        assert!(queue.claim_next(&caps).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_capabilities() {
        let queue = test_queue(3).await;
        queue.enqueue(spec("m1")).await.unwrap();
        assert!(queue.claim_next(&[JobType::Embedding]).await.unwrap().is_none());

        let job = queue
            .claim_next(&[JobType::TagExtraction])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exclusive() {
        let queue = test_queue(3).await;
        let jobs = 5;
        let workers = 8;
        for i in 0..jobs {
            queue.enqueue(spec(&format!("m{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.claim_next(&[JobType::TagExtraction]).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job.id);
            }
        }
        let distinct: HashSet<Uuid> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), distinct.len());
        assert_eq!(claimed.len(), jobs.min(workers));
    }

    #[tokio::test]
    async fn three_failures_exhaust_three_retries() {
        let queue = test_queue(3).await;
        let id = queue.enqueue(spec("m1")).await.unwrap().id();
        let caps = [JobType::TagExtraction];

        for attempt in 1..=3u32 {
            let job = queue.claim_next(&caps).await.unwrap().unwrap();
            assert_eq!(job.id, id);
            let outcome = queue.fail(id, "provider unavailable").await.unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, FailOutcome::Retrying { retry_count, .. } if retry_count == attempt));
            } else {
                assert_eq!(outcome, FailOutcome::Failed { retry_count: 3 });
            }
        }

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error.as_deref(), Some("provider unavailable"));
        assert!(job.output_data.is_none());
        assert!(queue.claim_next(&caps).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_retry_budget_fails_immediately() {
        let queue = test_queue(0).await;
        let id = queue.enqueue(spec("m1")).await.unwrap().id();
        queue.claim_next(&[JobType::TagExtraction]).await.unwrap();
        let outcome = queue.fail(id, "nope").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { retry_count: 0 });
    }

    #[tokio::test]
    async fn backoff_delays_eligibility() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let queue = JobQueue::new(
            Arc::new(db),
            RetryPolicy {
                max_retries: 3,
                backoff_base: Duration::from_secs(60),
            },
        );
        let id = queue.enqueue(spec("m1")).await.unwrap().id();
        let caps = [JobType::TagExtraction];
        queue.claim_next(&caps).await.unwrap();

        let outcome = queue.fail(id, "rate limited").await.unwrap();
        let FailOutcome::Retrying { next_eligible_at, .. } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert!(next_eligible_at > Utc::now() + chrono::Duration::seconds(50));
        assert!(queue.claim_next(&caps).await.unwrap().is_none());

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("rate limited"));
        assert!(job.error.is_none());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
        assert!(policy.backoff_delay(200) > Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn complete_requires_claim() {
        let queue = test_queue(3).await;
        let id = queue.enqueue(spec("m1")).await.unwrap().id();

        let err = queue.complete(id, json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        queue.claim_next(&[JobType::TagExtraction]).await.unwrap();
        queue.complete(id, json!({"tags": ["beach"]})).await.unwrap();

        let err = queue.fail(id, "late failure").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        let err = queue.complete(Uuid::new_v4(), json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_data, Some(json!({"tags": ["beach"]})));
    }

    #[tokio::test]
    async fn claim_token_detects_reclaim() {
        let queue = test_queue(3).await;
        queue.enqueue(spec("m1")).await.unwrap();
        let caps = [JobType::TagExtraction];

        let first = queue.claim_next(&caps).await.unwrap().unwrap();
        assert!(queue.still_claimed(&first).await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(!queue.still_claimed(&first).await.unwrap());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = queue.claim_next(&caps).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert!(!queue.still_claimed(&first).await.unwrap());
        assert!(queue.still_claimed(&second).await.unwrap());

        queue.complete(second.id, json!({})).await.unwrap();
        assert!(!queue.still_claimed(&second).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_only_while_pending() {
        let queue = test_queue(3).await;
        let pending = queue.enqueue(spec("m1")).await.unwrap().id();
        assert!(queue.cancel(pending).await.unwrap());
        assert!(queue.get(pending).await.unwrap().is_none());

        let claimed = queue.enqueue(spec("m2")).await.unwrap().id();
        queue.claim_next(&[JobType::TagExtraction]).await.unwrap();
        assert!(!queue.cancel(claimed).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_sweep_reclaims_orphans() {
        let queue = test_queue(3).await;
        let id = queue.enqueue(spec("m1")).await.unwrap().id();
        queue.claim_next(&[JobType::TagExtraction]).await.unwrap();

        assert_eq!(queue.recover_stale(Duration::from_secs(300)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.recover_stale(Duration::from_millis(5)).await.unwrap(), 1);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some(DEADLINE_EXCEEDED));
    }
}
