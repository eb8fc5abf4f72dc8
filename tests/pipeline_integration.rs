//! End-to-end tests: event → router → worker pool → handlers → memory.
//!
//! Each test opens a file-backed database in a temp dir and drives the
//! worker pool one job at a time with `run_once`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use enrich_pipeline::cache::{CacheManager, CachePolicy};
use enrich_pipeline::error::{HandlerError, LlmError};
use enrich_pipeline::events::{Event, EventRouter, default_route_table};
use enrich_pipeline::handlers::register_builtin_handlers;
use enrich_pipeline::jobs::{Job, JobQueue, JobSpec, JobStatus, JobType, RetryPolicy};
use enrich_pipeline::llm::LlmProvider;
use enrich_pipeline::memory::{KnowledgeType, MemoryConfig, MemoryManager};
use enrich_pipeline::store::{Database, LibSqlBackend};
use enrich_pipeline::vector::{InMemoryVectorIndex, VectorIndex};
use enrich_pipeline::worker::{
    Handler, HandlerContext, HandlerOutput, HandlerRegistry, JobRun, WorkerConfig, WorkerPool,
};

/// Stub LLM provider (no real API calls).
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn embedding_model_name(&self) -> &str {
        "stub-embed"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        if prompt.contains("sentiment") {
            Ok("0.8".to_string())
        } else {
            Ok("Beach, family, sunset".to_string())
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(vec![0.6, 0.8])
    }
}

/// Handler that always fails.
struct BrokenSearch;

#[async_trait]
impl Handler for BrokenSearch {
    fn job_type(&self) -> JobType {
        JobType::SearchContext
    }

    async fn execute(&self, job: &Job, _ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::Failed {
            job_type: job.job_type.to_string(),
            reason: "search backend unavailable".into(),
        })
    }
}

struct Harness {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    memory: Arc<MemoryManager>,
    cache: Arc<CacheManager>,
    registry: Arc<HandlerRegistry>,
    pool: WorkerPool,
}

async fn harness(path: &std::path::Path, policy: RetryPolicy) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(path).await.unwrap());
    let queue = Arc::new(JobQueue::new(Arc::clone(&db), policy));
    let cache = Arc::new(CacheManager::new(Arc::clone(&db), CachePolicy::default()));
    let memory = Arc::new(MemoryManager::new(Arc::clone(&db), MemoryConfig::default()));
    let registry = Arc::new(HandlerRegistry::new());
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        HandlerContext {
            cache: Arc::clone(&cache),
            memory: Arc::clone(&memory),
        },
        WorkerConfig {
            handler_timeout: Duration::from_secs(2),
            ..WorkerConfig::default()
        },
    );
    Harness {
        db,
        queue,
        memory,
        cache,
        registry,
        pool,
    }
}

/// Run jobs until nothing is claimable.
async fn drain(pool: &WorkerPool) -> Vec<JobRun> {
    let mut runs = Vec::new();
    while let Some(run) = pool.run_once().await.unwrap() {
        runs.push(run);
    }
    runs
}

#[tokio::test]
async fn memory_created_event_enriches_all_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir.path().join("enrich.db"), RetryPolicy::default()).await;
    let vectors = Arc::new(InMemoryVectorIndex::new());
    register_builtin_handlers(
        &h.registry,
        Some(Arc::new(StubLlm)),
        Arc::clone(&vectors) as Arc<dyn VectorIndex>,
    )
    .await;

    let router = EventRouter::new(default_route_table(), Arc::clone(&h.queue));
    let event = Event::new(
        "evt-1",
        "memory.created",
        "family-1",
        json!({"memory_id": "mem-1", "text": "Evening walk on the beach"}),
    )
    .with_user("user-1");

    let report = router.ingest(&event).await.unwrap();
    assert_eq!(report.enqueued, 3);

    let runs = drain(&h.pool).await;
    assert_eq!(runs, vec![JobRun::Completed; 3]);

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);

    let facts = h.memory.list_facts("family-1", None).await.unwrap();
    let tags = facts
        .iter()
        .find(|f| f.knowledge_type == KnowledgeType::EntityTags)
        .unwrap();
    assert_eq!(tags.knowledge_data["tags"], json!(["beach", "family", "sunset"]));
    assert_eq!(tags.source_event_ids, vec!["evt-1".to_string()]);
    assert!(facts.iter().any(|f| f.knowledge_type == KnowledgeType::Sentiment));

    let prefs = h.memory.get_preferences("user-1").await.unwrap();
    assert!(prefs.preferred_tags.contains("beach"));
    assert_eq!(prefs.sample_size, 1);

    assert_eq!(vectors.len().await, 1);
    assert_eq!(h.cache.stats().await.unwrap().entries, 3);

    // Redelivery produces no new work.
    let again = router.ingest(&event).await.unwrap();
    assert_eq!((again.enqueued, again.duplicates), (0, 3));
    assert!(drain(&h.pool).await.is_empty());
}

#[tokio::test]
async fn failing_handler_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let policy = RetryPolicy {
        max_retries: 2,
        backoff_base: Duration::from_millis(1),
    };
    let h = harness(&dir.path().join("enrich.db"), policy).await;
    h.registry.register(Arc::new(BrokenSearch)).await;

    let id = h
        .queue
        .enqueue(
            JobSpec::new(JobType::SearchContext, "search", "s-1", "family-1")
                .with_input(json!({"payload": {"query": "paris"}})),
        )
        .await
        .unwrap()
        .id();

    let mut runs = Vec::new();
    for _ in 0..50 {
        if let Some(run) = h.pool.run_once().await.unwrap() {
            let done = run == JobRun::Failed;
            runs.push(run);
            if done {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(runs, vec![JobRun::Retrying, JobRun::Failed]);

    let job = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert!(job.error.unwrap().contains("search backend unavailable"));
}

#[tokio::test]
async fn preferences_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("enrich.db");

    {
        let h = harness(&path, RetryPolicy::default()).await;
        register_builtin_handlers(&h.registry, None, Arc::new(InMemoryVectorIndex::new())).await;
        let router = EventRouter::new(default_route_table(), Arc::clone(&h.queue));
        let liked = Event::new(
            "evt-2",
            "memory.liked",
            "family-1",
            json!({"memory_id": "mem-9", "topics": {"travel": 0.9}}),
        )
        .with_user("user-1");

        let created = Event::new(
            "evt-3",
            "memory.created",
            "family-1",
            json!({"memory_id": "mem-9", "text": "Road trip"}),
        );

        router.ingest(&liked).await.unwrap();
        router.ingest(&created).await.unwrap();
        assert_eq!(drain(&h.pool).await, vec![JobRun::Completed]);

        // Model-backed jobs wait for a provider.
        let counts = h.db.job_counts().await.unwrap();
        assert_eq!((counts.pending, counts.completed), (3, 1));
    }

    let h = harness(&path, RetryPolicy::default()).await;
    let prefs = h.memory.get_preferences("user-1").await.unwrap();
    assert_eq!(prefs.sample_size, 1);
    assert!(prefs.preferred_topics.contains_key("travel"));
    assert_eq!(h.queue.stats().await.unwrap().pending, 3);
}
