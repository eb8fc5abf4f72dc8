//! Built-in enrichment handlers.
//!
//! Each handler is thin: it reads the routed event out of `input_data`,
//! consults the cache around any external call and describes its memory
//! writes as effects for the worker to apply.

pub mod embedding;
pub mod image_description;
pub mod preference_learning;
pub mod search_context;
pub mod sentiment;
pub mod tag_extraction;

pub use embedding::EmbeddingHandler;
pub use image_description::ImageDescriptionHandler;
pub use preference_learning::PreferenceLearningHandler;
pub use search_context::SearchContextHandler;
pub use sentiment::SentimentHandler;
pub use tag_extraction::TagExtractionHandler;

use std::sync::Arc;

use crate::error::HandlerError;
use crate::jobs::Job;
use crate::llm::LlmProvider;
use crate::vector::VectorIndex;
use crate::worker::HandlerRegistry;

/// Register every built-in handler. Handlers that need a model are skipped
/// when no provider is configured, so their jobs stay Pending.
pub async fn register_builtin_handlers(
    registry: &HandlerRegistry,
    llm: Option<Arc<dyn LlmProvider>>,
    vectors: Arc<dyn VectorIndex>,
) {
    registry.register(Arc::new(PreferenceLearningHandler)).await;
    registry.register(Arc::new(SearchContextHandler)).await;

    match llm {
        Some(llm) => {
            registry
                .register(Arc::new(TagExtractionHandler::new(Arc::clone(&llm))))
                .await;
            registry
                .register(Arc::new(SentimentHandler::new(Arc::clone(&llm))))
                .await;
            registry
                .register(Arc::new(ImageDescriptionHandler::new(Arc::clone(&llm))))
                .await;
            registry
                .register(Arc::new(EmbeddingHandler::new(llm, vectors)))
                .await;
        }
        None => {
            tracing::warn!("No LLM provider configured; model-backed handlers disabled");
        }
    }
}

/// The routed event's payload.
pub(crate) fn payload(job: &Job) -> &serde_json::Value {
    &job.input_data["payload"]
}

pub(crate) fn event_id(job: &Job) -> Option<&str> {
    job.input_data["event_id"].as_str()
}

pub(crate) fn event_type(job: &Job) -> &str {
    job.input_data["event_type"].as_str().unwrap_or_default()
}

/// Non-empty string field from the payload.
pub(crate) fn required_str<'a>(job: &'a Job, field: &str) -> Result<&'a str, HandlerError> {
    payload(job)[field]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::InvalidInput {
            job_type: job.job_type.to_string(),
            reason: format!("payload field '{field}' is missing or empty"),
        })
}

/// Entity text: `text`, falling back to `caption` then `title`.
pub(crate) fn entity_text(job: &Job) -> Result<&str, HandlerError> {
    ["text", "caption", "title"]
        .iter()
        .find_map(|f| required_str(job, f).ok())
        .ok_or_else(|| HandlerError::InvalidInput {
            job_type: job.job_type.to_string(),
            reason: "payload has no text, caption or title".into(),
        })
}

pub(crate) fn required_user(job: &Job) -> Result<&str, HandlerError> {
    job.user_id.as_deref().ok_or_else(|| HandlerError::InvalidInput {
        job_type: job.job_type.to_string(),
        reason: "event carries no user_id".into(),
    })
}
