//! Service assembly: one call opens storage and wires every component the
//! binary runs.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::CacheManager;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::events::{ConsumerStats, EventBus, EventPublisher, EventRouter, default_route_table, spawn_event_consumer};
use crate::handlers::register_builtin_handlers;
use crate::health::{self, HealthReport};
use crate::jobs::{JobQueue, QueueStats};
use crate::llm::create_provider;
use crate::memory::MemoryManager;
use crate::store::{Database, LibSqlBackend};
use crate::vector::{InMemoryVectorIndex, VectorIndex};
use crate::worker::{
    HandlerContext, HandlerRegistry, Maintenance, WorkerPool, spawn_maintenance_task,
};

/// Every long-lived service, wired together.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub db: Arc<dyn Database>,
    pub queue: Arc<JobQueue>,
    pub cache: Arc<CacheManager>,
    pub memory: Arc<MemoryManager>,
    pub vectors: Arc<dyn VectorIndex>,
    pub registry: Arc<HandlerRegistry>,
    pub router: Arc<EventRouter>,
    pub pool: Arc<WorkerPool>,
}

/// Background tasks started by [`Pipeline::start`].
pub struct RunningPipeline {
    pub publisher: EventPublisher,
    shutdown: watch::Sender<bool>,
    consumer: JoinHandle<ConsumerStats>,
    pool: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl Pipeline {
    /// Open the database at `config.db_path`, build the provider if one is
    /// configured and register the built-in handlers.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
        Self::with_store(config, db).await
    }

    /// Wire the services over an already-open store.
    pub async fn with_store(config: PipelineConfig, db: Arc<dyn Database>) -> Result<Self> {
        let queue = Arc::new(JobQueue::new(Arc::clone(&db), config.retry));
        let cache = Arc::new(CacheManager::new(Arc::clone(&db), config.cache.clone()));
        let memory = Arc::new(MemoryManager::new(Arc::clone(&db), config.memory));

        let llm = config.llm.as_ref().map(create_provider).transpose()?;
        let vectors: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let registry = Arc::new(HandlerRegistry::new());
        register_builtin_handlers(&registry, llm, Arc::clone(&vectors)).await;
        info!(handlers = ?registry.job_types().await, "Handlers registered");

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            HandlerContext {
                cache: Arc::clone(&cache),
                memory: Arc::clone(&memory),
            },
            config.worker.clone(),
        ));
        let router = Arc::new(EventRouter::new(default_route_table(), Arc::clone(&queue)));

        Ok(Self {
            config,
            db,
            queue,
            cache,
            memory,
            vectors,
            registry,
            router,
            pool,
        })
    }

    pub async fn health(&self) -> HealthReport {
        health::check(self.db.as_ref(), &self.config).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    /// Spawn the worker pool, the maintenance sweep and the event consumer.
    pub fn start(&self, event_buffer: usize) -> RunningPipeline {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pool = Arc::clone(&self.pool).spawn(shutdown_rx.clone());
        let maintenance = spawn_maintenance_task(
            Arc::new(Maintenance {
                queue: Arc::clone(&self.queue),
                cache: Arc::clone(&self.cache),
                memory: Arc::clone(&self.memory),
                max_processing: self.config.max_processing,
            }),
            self.config.recovery_interval,
            shutdown_rx,
        );

        let (publisher, rx) = EventBus::channel(event_buffer);
        let consumer = spawn_event_consumer(rx, Arc::clone(&self.router) as _);

        RunningPipeline {
            publisher,
            shutdown,
            consumer,
            pool,
            maintenance,
        }
    }
}

impl RunningPipeline {
    /// Drain published events, then stop the workers after their current
    /// job. Consumes the publisher, so every clone handed out must already
    /// be dropped for the drain to finish.
    pub async fn shutdown(self) -> std::result::Result<ConsumerStats, tokio::task::JoinError> {
        drop(self.publisher);
        let stats = self.consumer.await?;
        // send fails only when every receiver is gone, i.e. the tasks already exited
        let _ = self.shutdown.send(true);
        self.pool.await?;
        self.maintenance.await?;
        Ok(stats)
    }
}
