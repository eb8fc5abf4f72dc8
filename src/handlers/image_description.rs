//! Image description, keyed by content hash.
//!
//! Identical bytes always describe the same way, so results are cached
//! permanently under the content hash rather than the entity id.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{CacheKey, CacheType, content_hash};
use crate::error::HandlerError;
use crate::handlers::{event_id, payload, required_str};
use crate::jobs::{Job, JobType};
use crate::llm::LlmProvider;
use crate::memory::{Fact, KnowledgeType};
use crate::worker::{Handler, HandlerContext, HandlerOutput, MemoryEffect};

const DESCRIPTION_CONFIDENCE: f64 = 0.8;

pub struct ImageDescriptionHandler {
    llm: Arc<dyn LlmProvider>,
}

impl ImageDescriptionHandler {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Handler for ImageDescriptionHandler {
    fn job_type(&self) -> JobType {
        JobType::ImageDescription
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let url = required_str(job, "url")?;
        // Hosts that don't send a content hash fall back to hashing the URL.
        let hash = payload(job)["content_hash"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| content_hash(url.as_bytes()));
        let key = CacheKey::content_addressed(CacheType::MediaAnalysis, &hash);

        let cached = ctx
            .cache
            .memoize(&key, || async move {
                let prompt = format!(
                    "Describe the image at {url} in one or two sentences for a family photo \
                     archive. Mention people, place and activity when visible."
                );
                let description = self.llm.generate(&prompt).await?;
                Ok::<_, HandlerError>(json!(description.trim()))
            })
            .await?;

        let description = cached.as_str().unwrap_or_default().to_string();
        if description.is_empty() {
            return Err(HandlerError::Failed {
                job_type: job.job_type.to_string(),
                reason: "model returned an empty description".into(),
            });
        }

        let mut fact = Fact::new(
            KnowledgeType::MediaDescription,
            json!({
                "content_hash": hash,
                "description": description,
            }),
            DESCRIPTION_CONFIDENCE,
        )
        .related_to(&job.entity_id)
        .with_dedup_key(format!("media_description:{hash}"));
        if let Some(event_id) = event_id(job) {
            fact = fact.from_event(event_id);
        }

        Ok(
            HandlerOutput::new(json!({ "description": description, "content_hash": hash }))
                .with_effect(MemoryEffect::Knowledge {
                    group_id: job.group_id.clone(),
                    fact,
                }),
        )
    }
}
