//! Worker pool: a fixed number of claim/execute/report loops.
//!
//! Each loop takes a concurrency slot, claims a job, releases every store
//! lock, runs the handler under a deadline, applies the handler's memory
//! effects and reports back. A per-job-type semaphore caps how many handlers
//! of one type run at once so a rate-limited provider never sees unbounded
//! fan-out.
//!
//! Effects are applied at least once. Each carries an observation ID derived
//! from the job and its position in the output, and the memory tiers skip IDs
//! they have already recorded, so a re-run never counts twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, HandlerError, JobError};
use crate::jobs::{FailOutcome, Job, JobQueue, JobType};
use crate::worker::handler::{HandlerContext, HandlerRegistry, MemoryEffect};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Concurrency cap for job types without an explicit override.
    pub handler_concurrency: usize,
    pub handler_concurrency_overrides: HashMap<JobType, usize>,
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            handler_concurrency: 2,
            handler_concurrency_overrides: HashMap::new(),
            handler_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn concurrency_for(&self, job_type: JobType) -> usize {
        self.handler_concurrency_overrides
            .get(&job_type)
            .copied()
            .unwrap_or(self.handler_concurrency)
            .max(1)
    }
}

/// How one claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    Retrying,
    Failed,
    /// Outcome report was rejected, e.g. the recovery sweep reclaimed the job.
    Stale,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    ctx: HandlerContext,
    config: WorkerConfig,
    limits: HashMap<JobType, Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        ctx: HandlerContext,
        config: WorkerConfig,
    ) -> Self {
        let limits = JobType::ALL
            .iter()
            .map(|t| (*t, Arc::new(Semaphore::new(config.concurrency_for(*t)))))
            .collect();
        Self {
            queue,
            registry,
            ctx,
            config,
            limits,
        }
    }

    /// Spawn the worker loops. They exit when `shutdown` flips to `true`,
    /// after finishing the job in hand.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let workers = self.config.workers.max(1);
            info!(workers, "Worker pool starting");
            let loops = (0..workers).map(|idx| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(idx, shutdown).await })
            });
            for result in join_all(loops).await {
                if let Err(e) = result {
                    error!("Worker task panicked: {e}");
                }
            }
            info!("Worker pool stopped");
        })
    }

    async fn worker_loop(&self, idx: usize, mut shutdown: watch::Receiver<bool>) {
        let notify = self.queue.notifier();
        debug!(worker = idx, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let notified = notify.notified();
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = idx, "Worker iteration failed: {e}"),
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker = idx, "Worker stopped");
    }

    /// Claim and run at most one job. `None` when nothing was claimable.
    ///
    /// The concurrency slot is taken before the claim, so a claimed job never
    /// waits for a slot while its processing deadline runs.
    pub async fn run_once(&self) -> Result<Option<JobRun>, JobError> {
        let mut permits = self.reserve_slots().await;
        if permits.is_empty() {
            return Ok(None);
        }

        let capabilities: Vec<JobType> = permits.keys().copied().collect();
        let Some(job) = self.queue.claim_next(&capabilities).await? else {
            return Ok(None);
        };

        let _permit = permits.remove(&job.job_type);
        drop(permits);

        Ok(Some(self.process(job).await?))
    }

    /// One free slot for every registered job type that has one.
    async fn reserve_slots(&self) -> HashMap<JobType, OwnedSemaphorePermit> {
        let mut permits = HashMap::new();
        for job_type in self.registry.job_types().await {
            if let Some(permit) = self
                .limits
                .get(&job_type)
                .and_then(|limit| Arc::clone(limit).try_acquire_owned().ok())
            {
                permits.insert(job_type, permit);
            }
        }
        permits
    }

    async fn process(&self, job: Job) -> Result<JobRun, JobError> {
        let Some(handler) = self.registry.get(job.job_type).await else {
            let err = HandlerError::NotRegistered {
                job_type: job.job_type.to_string(),
            };
            return self.report_failure(&job, &err.to_string()).await;
        };

        let timeout = self.config.handler_timeout;
        let result = match tokio::time::timeout(timeout, handler.execute(&job, &self.ctx)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout {
                job_type: job.job_type.to_string(),
                timeout,
            }),
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => return self.report_failure(&job, &e.to_string()).await,
        };

        if !self.queue.still_claimed(&job).await? {
            warn!(job_id = %job.id, "Claim lost while the handler ran, discarding its output");
            return Ok(JobRun::Stale);
        }

        for (idx, effect) in output.effects.into_iter().enumerate() {
            let effect = effect.observed_as(format!("{}#{idx}", job.id));
            if let Err(e) = self.apply_effect(effect).await {
                let err = HandlerError::Database(e);
                return self.report_failure(&job, &err.to_string()).await;
            }
        }

        match self.queue.complete(job.id, output.data).await {
            Ok(()) => {
                if let Some(elapsed) = job.elapsed() {
                    debug!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Handler finished");
                }
                Ok(JobRun::Completed)
            }
            Err(JobError::InvalidTransition { state, .. }) => {
                warn!(job_id = %job.id, %state, "Completion ignored, job no longer processing");
                Ok(JobRun::Stale)
            }
            Err(e) => Err(e),
        }
    }

    async fn report_failure(&self, job: &Job, reason: &str) -> Result<JobRun, JobError> {
        match self.queue.fail(job.id, reason).await {
            Ok(FailOutcome::Retrying { .. }) => Ok(JobRun::Retrying),
            Ok(FailOutcome::Failed { .. }) => Ok(JobRun::Failed),
            Err(JobError::InvalidTransition { state, .. }) => {
                warn!(job_id = %job.id, %state, "Failure ignored, job no longer processing");
                Ok(JobRun::Stale)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_effect(&self, effect: MemoryEffect) -> Result<(), DatabaseError> {
        let memory = &self.ctx.memory;
        match effect {
            MemoryEffect::Session {
                user_id,
                key,
                value,
                ttl,
            } => {
                memory.set_session(&user_id, &key, value, ttl).await;
            }
            MemoryEffect::Preference { user_id, signal } => {
                memory.apply_observation(&user_id, &signal).await?;
            }
            MemoryEffect::Knowledge { group_id, fact } => {
                memory.record_fact(&group_id, &fact).await?;
            }
        }
        Ok(())
    }
}
