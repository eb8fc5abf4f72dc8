//! Search context: keeps the user's active and recent search terms in the
//! session tier.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::HandlerError;
use crate::handlers::{required_str, required_user};
use crate::jobs::{Job, JobType};
use crate::worker::{Handler, HandlerContext, HandlerOutput, MemoryEffect};

const ACTIVE_SEARCH_KEY: &str = "active_search";
const RECENT_SEARCHES_KEY: &str = "recent_searches";
const MAX_RECENT_SEARCHES: usize = 10;

pub struct SearchContextHandler;

#[async_trait]
impl Handler for SearchContextHandler {
    fn job_type(&self) -> JobType {
        JobType::SearchContext
    }

    async fn execute(&self, job: &Job, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let user_id = required_user(job)?;
        let query = required_str(job, "query")?;
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

        let mut recent: Vec<Value> = ctx
            .memory
            .get_session(user_id, RECENT_SEARCHES_KEY)
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        recent.retain(|v| v.as_str() != Some(query));
        recent.insert(0, json!(query));
        recent.truncate(MAX_RECENT_SEARCHES);

        Ok(HandlerOutput::new(json!({ "query": query, "terms": terms }))
            .with_effect(MemoryEffect::Session {
                user_id: user_id.to_string(),
                key: ACTIVE_SEARCH_KEY.to_string(),
                value: json!({ "query": query, "terms": terms }),
                ttl: None,
            })
            .with_effect(MemoryEffect::Session {
                user_id: user_id.to_string(),
                key: RECENT_SEARCHES_KEY.to_string(),
                value: Value::Array(recent),
                ttl: None,
            }))
    }
}
