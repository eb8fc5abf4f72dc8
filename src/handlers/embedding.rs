//! Embedding: vectors for entity text, stored in the similarity index.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{CacheKey, CacheType};
use crate::error::HandlerError;
use crate::handlers::entity_text;
use crate::jobs::{Job, JobType};
use crate::llm::LlmProvider;
use crate::vector::VectorIndex;
use crate::worker::{Handler, HandlerContext, HandlerOutput};

pub struct EmbeddingHandler {
    llm: Arc<dyn LlmProvider>,
    vectors: Arc<dyn VectorIndex>,
}

impl EmbeddingHandler {
    pub fn new(llm: Arc<dyn LlmProvider>, vectors: Arc<dyn VectorIndex>) -> Self {
        Self { llm, vectors }
    }
}

#[async_trait]
impl Handler for EmbeddingHandler {
    fn job_type(&self) -> JobType {
        JobType::Embedding
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let text = entity_text(job)?;
        let key = CacheKey::derive(
            CacheType::Embedding,
            &format!("embedding/{}", self.llm.embedding_model_name()),
            &json!({ "text": text }),
            &json!({}),
        );

        let cached = ctx
            .cache
            .memoize(&key, || async move {
                let vector = self.llm.embed(text).await?;
                Ok::<_, HandlerError>(json!(vector))
            })
            .await?;

        let vector: Vec<f32> = serde_json::from_value(cached).map_err(|e| HandlerError::Failed {
            job_type: job.job_type.to_string(),
            reason: format!("cached embedding is malformed: {e}"),
        })?;
        let dimensions = vector.len();

        self.vectors.upsert(&job.entity_id, vector).await?;
        tracing::debug!(entity_id = %job.entity_id, dimensions, "Embedding indexed");

        Ok(HandlerOutput::new(json!({ "dimensions": dimensions })))
    }
}
