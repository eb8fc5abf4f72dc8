//! Handler capability and registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::CacheManager;
use crate::error::HandlerError;
use crate::jobs::{Job, JobType};
use crate::memory::{Fact, MemoryManager, PreferenceSignal};

/// A write the worker performs through the memory manager once the handler
/// has returned.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEffect {
    Session {
        user_id: String,
        key: String,
        value: serde_json::Value,
        ttl: Option<Duration>,
    },
    Preference {
        user_id: String,
        signal: PreferenceSignal,
    },
    Knowledge {
        group_id: String,
        fact: Fact,
    },
}

impl MemoryEffect {
    /// Tag a preference or knowledge write with an observation ID, unless
    /// the handler already chose one. Session writes are overwrites and need
    /// none.
    pub fn observed_as(mut self, id: impl Into<String>) -> Self {
        match &mut self {
            Self::Preference { signal, .. } => {
                signal.observation_id.get_or_insert_with(|| id.into());
            }
            Self::Knowledge { fact, .. } => {
                fact.observation_id.get_or_insert_with(|| id.into());
            }
            Self::Session { .. } => {}
        }
        self
    }
}

/// What a handler produced: the job's output plus memory writes.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub data: serde_json::Value,
    pub effects: Vec<MemoryEffect>,
}

impl HandlerOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: MemoryEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Shared services handlers may consult while running.
#[derive(Clone)]
pub struct HandlerContext {
    pub cache: Arc<CacheManager>,
    pub memory: Arc<MemoryManager>,
}

/// Executes one job type.
#[async_trait]
pub trait Handler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run the job. Must not touch the job queue; the worker reports the
    /// outcome.
    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError>;
}

/// Registry of handlers by job type. Its keys are the worker capability set.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for its job type.
    pub async fn register(&self, handler: Arc<dyn Handler>) {
        let job_type = handler.job_type();
        if self
            .handlers
            .write()
            .await
            .insert(job_type, handler)
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "Replaced existing handler");
        } else {
            tracing::debug!("Registered handler: {}", job_type);
        }
    }

    pub async fn get(&self, job_type: JobType) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await.get(&job_type).cloned()
    }

    /// Registered job types, in a stable order.
    pub async fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.read().await.keys().copied().collect();
        types.sort();
        types
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
