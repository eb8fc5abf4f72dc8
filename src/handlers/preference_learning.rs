//! Preference learning from view and like interactions. No external calls.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::HandlerError;
use crate::handlers::{event_type, payload, required_user};
use crate::jobs::{Job, JobType};
use crate::memory::PreferenceSignal;
use crate::worker::{Handler, HandlerContext, HandlerOutput, MemoryEffect};

const RECENT_VIEWS_KEY: &str = "recent_views";
const MAX_RECENT_VIEWS: usize = 20;

pub struct PreferenceLearningHandler;

/// Like counts double a view.
fn interaction(event_type: &str) -> (&'static str, f64) {
    if event_type.ends_with(".liked") {
        ("like", 1.0)
    } else {
        ("view", 0.5)
    }
}

/// Build a signal from `topics` (map of weights or plain list) and `tags`.
pub fn signal_from_payload(payload: &Value, source: &str, weight: f64) -> PreferenceSignal {
    let mut signal = PreferenceSignal::default().source(source);

    match &payload["topics"] {
        Value::Object(map) => {
            for (topic, w) in map {
                if let Some(w) = w.as_f64() {
                    signal = signal.topic(topic.to_lowercase(), (w * weight).clamp(0.0, 1.0));
                }
            }
        }
        Value::Array(items) => {
            for topic in items.iter().filter_map(Value::as_str) {
                signal = signal.topic(topic.to_lowercase(), weight);
            }
        }
        _ => {}
    }

    if let Some(tags) = payload["tags"].as_array() {
        for tag in tags.iter().filter_map(Value::as_str) {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                signal = signal.tag(tag);
            }
        }
    }
    signal
}

#[async_trait]
impl Handler for PreferenceLearningHandler {
    fn job_type(&self) -> JobType {
        JobType::PreferenceLearning
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let user_id = required_user(job)?;
        let (source, weight) = interaction(event_type(job));
        let signal = signal_from_payload(payload(job), source, weight);

        let mut recent: Vec<Value> = ctx
            .memory
            .get_session(user_id, RECENT_VIEWS_KEY)
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        recent.retain(|v| v.as_str() != Some(job.entity_id.as_str()));
        recent.insert(0, json!(job.entity_id));
        recent.truncate(MAX_RECENT_VIEWS);

        let data = json!({
            "interaction": source,
            "topics": signal.topics.len(),
            "tags": signal.tags.len(),
        });
        let mut output = HandlerOutput::new(data).with_effect(MemoryEffect::Session {
            user_id: user_id.to_string(),
            key: RECENT_VIEWS_KEY.to_string(),
            value: Value::Array(recent),
            ttl: None,
        });
        if !signal.is_empty() {
            output = output.with_effect(MemoryEffect::Preference {
                user_id: user_id.to_string(),
                signal,
            });
        }
        Ok(output)
    }
}
