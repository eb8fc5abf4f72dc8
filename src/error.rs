//! Error types for the enrichment pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Vector index error: {0}")]
    Vector(#[from] VectorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job {id} exhausted {max_retries} retries: {reason}")]
    ExhaustedRetries {
        id: Uuid,
        max_retries: u32,
        reason: String,
    },

    #[error("Job store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors raised by a job handler. All of them end up in `JobQueue::fail`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler registered for job type {job_type}")]
    NotRegistered { job_type: String },

    #[error("Handler {job_type} failed: {reason}")]
    Failed { job_type: String, reason: String },

    #[error("Handler {job_type} timed out after {timeout:?}")]
    Timeout { job_type: String, timeout: Duration },

    #[error("Invalid input for handler {job_type}: {reason}")]
    InvalidInput { job_type: String, reason: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Vector index error: {0}")]
    Vector(#[from] VectorError),
}

/// Vector index errors.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty vector for {id}")]
    Empty { id: String },
}

/// LLM / embedding provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
