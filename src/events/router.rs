//! Event router: maps events to job specs and enqueues them.

use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::events::Event;
use crate::jobs::{EnqueueOutcome, JobQueue, JobSpec, JobType};

/// Which event types a rule applies to.
#[derive(Debug, Clone)]
pub enum EventMatcher {
    Exact(String),
    Pattern(Regex),
}

impl EventMatcher {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(name) => name == event_type,
            Self::Pattern(re) => re.is_match(event_type),
        }
    }
}

/// Where a rule finds the id of the entity the job operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySource {
    PayloadField(String),
    EventId,
}

/// One row of the routing table.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub matcher: EventMatcher,
    pub job_type: JobType,
    pub priority: i32,
    pub entity_type: String,
    pub entity: EntitySource,
}

/// Static, extensible lookup table from event type to jobs.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: RouteRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Rule for one exact event type, entity id read from `entity_field`.
    pub fn exact(
        self,
        event_type: &str,
        job_type: JobType,
        priority: i32,
        entity_type: &str,
        entity_field: &str,
    ) -> Self {
        self.rule(RouteRule {
            matcher: EventMatcher::Exact(event_type.to_string()),
            job_type,
            priority,
            entity_type: entity_type.to_string(),
            entity: EntitySource::PayloadField(entity_field.to_string()),
        })
    }

    /// Rule for every event type matching `pattern`.
    pub fn pattern(
        self,
        pattern: &str,
        job_type: JobType,
        priority: i32,
        entity_type: &str,
        entity_field: &str,
    ) -> Result<Self, regex::Error> {
        let re = Regex::new(pattern)?;
        Ok(self.rule(RouteRule {
            matcher: EventMatcher::Pattern(re),
            job_type,
            priority,
            entity_type: entity_type.to_string(),
            entity: EntitySource::PayloadField(entity_field.to_string()),
        }))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Job specs for an event, at most one per job type. Unknown event types
    /// yield an empty list.
    pub fn route(&self, event: &Event) -> Vec<JobSpec> {
        let mut specs: Vec<JobSpec> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.matcher.matches(&event.event_type)) {
            if specs.iter().any(|s| s.job_type == rule.job_type) {
                continue;
            }

            let entity_id = match &rule.entity {
                EntitySource::PayloadField(field) => event.payload_str(field).unwrap_or_default(),
                EntitySource::EventId => event.event_id.clone(),
            };

            let mut spec = JobSpec::new(rule.job_type, &rule.entity_type, entity_id, &event.group_id)
                .with_priority(rule.priority)
                .with_dedup_key(format!("{}:{}", event.event_id, rule.job_type))
                .with_input(json!({
                    "event_id": event.event_id,
                    "event_type": event.event_type,
                    "timestamp": event.timestamp,
                    "payload": event.payload,
                }));
            if let Some(user_id) = &event.user_id {
                spec = spec.with_user(user_id);
            }
            specs.push(spec);
        }
        specs
    }
}

/// Routing table for the host application's activity events.
pub fn default_route_table() -> RouteTable {
    let table = RouteTable::new()
        .exact("memory.created", JobType::TagExtraction, 3, "memory", "memory_id")
        .exact("memory.created", JobType::SentimentAnalysis, 5, "memory", "memory_id")
        .exact("memory.updated", JobType::TagExtraction, 3, "memory", "memory_id")
        .exact("memory.updated", JobType::SentimentAnalysis, 5, "memory", "memory_id")
        .exact("media.uploaded", JobType::ImageDescription, 4, "media", "media_id")
        .rule(RouteRule {
            matcher: EventMatcher::Exact("search.performed".into()),
            job_type: JobType::SearchContext,
            priority: 8,
            entity_type: "search".into(),
            entity: EntitySource::EventId,
        });

    // Patterns are literals.
    let with_patterns = table
        .clone()
        .pattern(r"^memory\.(created|updated)$", JobType::Embedding, 7, "memory", "memory_id")
        .and_then(|t| {
            t.pattern(r"^memory\.(viewed|liked)$", JobType::PreferenceLearning, 6, "memory", "memory_id")
        });
    match with_patterns {
        Ok(t) => t,
        Err(e) => {
            warn!("Default route patterns failed to compile: {e}");
            table
        }
    }
}

/// Outcome of ingesting one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub enqueued: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Routes events and enqueues the resulting jobs.
pub struct EventRouter {
    table: RouteTable,
    queue: Arc<JobQueue>,
}

impl EventRouter {
    pub fn new(table: RouteTable, queue: Arc<JobQueue>) -> Self {
        Self { table, queue }
    }

    pub fn route(&self, event: &Event) -> Vec<JobSpec> {
        self.table.route(event)
    }

    /// Route and enqueue. Re-delivering an event is a no-op for every job it
    /// already produced. An invalid spec is counted and skipped; only store
    /// errors abort.
    pub async fn ingest(&self, event: &Event) -> Result<IngestReport, JobError> {
        let specs = self.route(event);
        if specs.is_empty() {
            debug!(event_id = %event.event_id, event_type = %event.event_type, "No routes for event");
            return Ok(IngestReport::default());
        }

        let mut report = IngestReport::default();
        for spec in specs {
            let job_type = spec.job_type;
            match self.queue.enqueue(spec).await {
                Ok(EnqueueOutcome::Created(_)) => report.enqueued += 1,
                Ok(EnqueueOutcome::Duplicate(_)) => report.duplicates += 1,
                Err(JobError::InvalidSpec { reason }) => {
                    warn!(event_id = %event.event_id, job_type = %job_type, "Rejected job spec: {reason}");
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Event ingested"
        );
        Ok(report)
    }
}
