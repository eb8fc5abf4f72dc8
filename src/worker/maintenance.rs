//! Periodic maintenance: stale-job recovery and eager eviction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::CacheManager;
use crate::jobs::JobQueue;
use crate::memory::MemoryManager;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered_jobs: usize,
    pub purged_cache_entries: usize,
    pub purged_sessions: usize,
}

pub struct Maintenance {
    pub queue: Arc<JobQueue>,
    pub cache: Arc<CacheManager>,
    pub memory: Arc<MemoryManager>,
    /// Processing jobs older than this are reclaimed.
    pub max_processing: Duration,
}

impl Maintenance {
    /// Run every step once. A failing step is logged and doesn't stop the
    /// others.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.queue.recover_stale(self.max_processing).await {
            Ok(n) => report.recovered_jobs = n,
            Err(e) => error!("Stale job recovery failed: {e}"),
        }
        match self.cache.purge_expired().await {
            Ok(n) => report.purged_cache_entries = n,
            Err(e) => error!("Cache purge failed: {e}"),
        }
        report.purged_sessions = self.memory.purge_sessions().await;

        if report != SweepReport::default() {
            info!(
                recovered_jobs = report.recovered_jobs,
                purged_cache_entries = report.purged_cache_entries,
                purged_sessions = report.purged_sessions,
                "Maintenance sweep"
            );
        }
        report
    }
}

/// Spawn a background task that sweeps every `interval` until shutdown.
pub fn spawn_maintenance_task(
    maintenance: Arc<Maintenance>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    maintenance.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CachePolicy, CacheTtl, CacheType};
    use crate::jobs::{JobSpec, JobStatus, JobType, RetryPolicy};
    use crate::memory::MemoryConfig;
    use crate::store::{Database, LibSqlBackend};
    use serde_json::json;

    #[tokio::test]
    async fn sweep_recovers_and_purges() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(Arc::clone(&db), RetryPolicy::default()));
        let cache = Arc::new(CacheManager::new(Arc::clone(&db), CachePolicy::default()));
        let memory = Arc::new(MemoryManager::new(db, MemoryConfig::default()));

        let id = queue
            .enqueue(JobSpec::new(JobType::Embedding, "memory", "m1", "g1"))
            .await
            .unwrap()
            .id();
        queue.claim_next(&[JobType::Embedding]).await.unwrap();

        let key = CacheKey::derive(CacheType::Sentiment, "s", &json!("x"), &json!({}));
        cache
            .put(&key, json!(0.1), CacheTtl::Expires(Duration::from_millis(1)))
            .await
            .unwrap();
        memory
            .set_session("u1", "k", json!(1), Some(Duration::from_millis(1)))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let maintenance = Maintenance {
            queue: Arc::clone(&queue),
            cache,
            memory,
            max_processing: Duration::from_millis(5),
        };
        let report = maintenance.sweep().await;
        assert_eq!(
            report,
            SweepReport {
                recovered_jobs: 1,
                purged_cache_entries: 1,
                purged_sessions: 1,
            }
        );
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
    }
}
