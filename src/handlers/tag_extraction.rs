//! Tag extraction: short descriptive tags for an entity's text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{CacheKey, CacheType};
use crate::error::HandlerError;
use crate::handlers::{entity_text, event_id};
use crate::jobs::{Job, JobType};
use crate::llm::LlmProvider;
use crate::memory::{Fact, KnowledgeType, PreferenceSignal};
use crate::worker::{Handler, HandlerContext, HandlerOutput, MemoryEffect};

const MAX_TAGS: usize = 8;

/// Confidence of a single model-extracted tag set.
const TAG_CONFIDENCE: f64 = 0.7;

pub struct TagExtractionHandler {
    llm: Arc<dyn LlmProvider>,
}

impl TagExtractionHandler {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

/// Split a model reply into normalized tags: lowercase, no `#` or list
/// markers, deduplicated, order kept.
pub fn parse_tags(reply: &str, max: usize) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for raw in reply.split([',', '\n', ';']) {
        let tag = raw
            .trim()
            .trim_start_matches(['-', '*', '#', '•'])
            .trim()
            .trim_matches(['"', '\'', '.'])
            .to_lowercase();
        if tag.is_empty() || tag.len() > 40 || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
        if tags.len() == max {
            break;
        }
    }
    tags
}

#[async_trait]
impl Handler for TagExtractionHandler {
    fn job_type(&self) -> JobType {
        JobType::TagExtraction
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let text = entity_text(job)?;
        let key = CacheKey::derive(
            CacheType::Tags,
            &format!("tag_extraction/{}", self.llm.model_name()),
            &json!({ "text": text }),
            &json!({ "max_tags": MAX_TAGS }),
        );

        let cached = ctx
            .cache
            .memoize(&key, || async move {
                let prompt = format!(
                    "List up to {MAX_TAGS} short, lowercase tags describing this family memory. \
                     Reply with a comma-separated list only.\n\n{text}"
                );
                let reply = self.llm.generate(&prompt).await?;
                Ok::<_, HandlerError>(json!(parse_tags(&reply, MAX_TAGS)))
            })
            .await?;

        let tags: Vec<String> = serde_json::from_value(cached).map_err(|e| HandlerError::Failed {
            job_type: job.job_type.to_string(),
            reason: format!("cached tags are malformed: {e}"),
        })?;

        let mut fact = Fact::new(
            KnowledgeType::EntityTags,
            json!({
                "entity_type": job.entity_type,
                "entity_id": job.entity_id,
                "tags": tags,
            }),
            TAG_CONFIDENCE,
        )
        .related_to(&job.entity_id)
        .with_dedup_key(format!("entity_tags:{}:{}", job.entity_type, job.entity_id));
        if let Some(event_id) = event_id(job) {
            fact = fact.from_event(event_id);
        }

        let mut output = HandlerOutput::new(json!({ "tags": tags })).with_effect(MemoryEffect::Knowledge {
            group_id: job.group_id.clone(),
            fact,
        });

        if let Some(user_id) = &job.user_id
            && !tags.is_empty()
        {
            let signal = tags.iter().fold(PreferenceSignal::default().source("create"), |s, t| {
                s.tag(t).topic(t, 1.0)
            });
            output = output.with_effect(MemoryEffect::Preference {
                user_id: user_id.clone(),
                signal,
            });
        }

        Ok(output)
    }
}
