//! Job model and state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Priority given to specs that don't set one. Lower is more urgent.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Handler key for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    TagExtraction,
    SentimentAnalysis,
    ImageDescription,
    PreferenceLearning,
    SearchContext,
    Embedding,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::TagExtraction,
        JobType::SentimentAnalysis,
        JobType::ImageDescription,
        JobType::PreferenceLearning,
        JobType::SearchContext,
        JobType::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TagExtraction => "tag_extraction",
            Self::SentimentAnalysis => "sentiment_analysis",
            Self::ImageDescription => "image_description",
            Self::PreferenceLearning => "preference_learning",
            Self::SearchContext => "search_context",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| JobError::InvalidSpec {
                reason: format!("unrecognized job type '{s}'"),
            })
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly delayed by backoff).
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Handler succeeded; `output_data` is set.
    Completed,
    /// Retries exhausted; `error` is set.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: JobType,
    pub entity_type: String,
    pub entity_id: String,
    pub group_id: String,
    /// User whose activity produced the job, if any.
    pub user_id: Option<String>,
    pub priority: i32,
    pub input_data: serde_json::Value,
    /// Overrides the queue's default retry budget.
    pub max_retries: Option<u32>,
    /// Identity for duplicate suppression, usually `event_id:job_type`.
    pub dedup_key: Option<String>,
}

impl JobSpec {
    pub fn new(
        job_type: JobType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            job_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            group_id: group_id.into(),
            user_id: None,
            priority: DEFAULT_PRIORITY,
            input_data: serde_json::Value::Null,
            max_retries: None,
            dedup_key: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// A unit of deferred enrichment work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub entity_type: String,
    pub entity_id: String,
    pub group_id: String,
    pub user_id: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub input_data: serde_json::Value,
    /// Present iff `status == Completed`.
    pub output_data: Option<serde_json::Value>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    /// Most recent handler error, kept across retries.
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Backoff gate: not claimable before this instant.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh Pending job from a spec.
    pub fn from_spec(spec: JobSpec, default_max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            entity_type: spec.entity_type,
            entity_id: spec.entity_id,
            group_id: spec.group_id,
            user_id: spec.user_id,
            priority: spec.priority,
            status: JobStatus::Pending,
            input_data: spec.input_data,
            output_data: None,
            error: None,
            last_error: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            dedup_key: spec.dedup_key,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_eligible_at: None,
        }
    }

    /// Time spent in the current (or last) processing attempt.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the job may be claimed at `now`. The store's claim query
    /// applies the same rule in SQL.
    #[cfg(test)]
    pub(crate) fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_eligible_at.is_none_or(|t| t <= now)
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new Pending job was created.
    Created(Uuid),
    /// A job with the same dedup key already exists; nothing was written.
    Duplicate(Uuid),
}

impl EnqueueOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}
