//! Sentiment analysis: a score in [-1, 1] for an entity's text.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::cache::{CacheKey, CacheType};
use crate::error::HandlerError;
use crate::handlers::{entity_text, event_id};
use crate::jobs::{Job, JobType};
use crate::llm::LlmProvider;
use crate::memory::{Fact, KnowledgeType};
use crate::worker::{Handler, HandlerContext, HandlerOutput, MemoryEffect};

const SENTIMENT_CONFIDENCE: f64 = 0.6;

static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").ok());

pub struct SentimentHandler {
    llm: Arc<dyn LlmProvider>,
}

impl SentimentHandler {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

/// First number in the reply, clamped to [-1, 1].
pub fn parse_score(reply: &str) -> Option<f64> {
    let re = NUMBER.as_ref()?;
    let score: f64 = re.find(reply)?.as_str().parse().ok()?;
    Some(score.clamp(-1.0, 1.0))
}

pub fn label(score: f64) -> &'static str {
    if score > 0.25 {
        "positive"
    } else if score < -0.25 {
        "negative"
    } else {
        "neutral"
    }
}

#[async_trait]
impl Handler for SentimentHandler {
    fn job_type(&self) -> JobType {
        JobType::SentimentAnalysis
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let text = entity_text(job)?;
        let job_type = job.job_type.to_string();
        let key = CacheKey::derive(
            CacheType::Sentiment,
            &format!("sentiment/{}", self.llm.model_name()),
            &json!({ "text": text }),
            &json!({}),
        );

        let job_type_ref = &job_type;
        let cached = ctx
            .cache
            .memoize(&key, || async move {
                let prompt = format!(
                    "Rate the sentiment of this text from -1 (very negative) to 1 (very positive). \
                     Reply with the number only.\n\n{text}"
                );
                let reply = self.llm.generate(&prompt).await?;
                let score = parse_score(&reply).ok_or_else(|| HandlerError::Failed {
                    job_type: job_type_ref.clone(),
                    reason: format!("no score in model reply '{reply}'"),
                })?;
                Ok::<_, HandlerError>(json!(score))
            })
            .await?;

        let score = cached.as_f64().ok_or_else(|| HandlerError::Failed {
            job_type: job_type.clone(),
            reason: "cached sentiment is not a number".into(),
        })?;

        let mut fact = Fact::new(
            KnowledgeType::Sentiment,
            json!({
                "entity_type": job.entity_type,
                "entity_id": job.entity_id,
                "score": score,
                "label": label(score),
            }),
            SENTIMENT_CONFIDENCE,
        )
        .related_to(&job.entity_id)
        .with_dedup_key(format!("sentiment:{}:{}", job.entity_type, job.entity_id));
        if let Some(event_id) = event_id(job) {
            fact = fact.from_event(event_id);
        }

        Ok(
            HandlerOutput::new(json!({ "score": score, "label": label(score) })).with_effect(
                MemoryEffect::Knowledge {
                    group_id: job.group_id.clone(),
                    fact,
                },
            ),
        )
    }
}
