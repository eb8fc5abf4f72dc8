//! OpenAI-compatible REST provider (OpenAI, OpenRouter, Ollama, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::llm::{LlmConfig, LlmProvider};

const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    embedding_model: String,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "OpenAI request failed: {}", truncate(&text, 200));

            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("HTTP {status}: {}", truncate(&text, 200)),
                },
            });
        }

        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;
        parse_body(&text)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embedding_model_name(&self) -> &str {
        &self.embedding_model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        });
        let response = self.post("/chat/completions", body).await?;
        parse_chat_response(&response)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let response = self.post("/embeddings", body).await?;
        parse_embedding_response(&response)
    }
}

fn invalid(reason: &str) -> LlmError {
    LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason: reason.to_string(),
    }
}

pub(crate) fn parse_body(text: &str) -> Result<Value, LlmError> {
    Ok(serde_json::from_str(text)?)
}

/// `choices[0].message.content`.
pub(crate) fn parse_chat_response(response: &Value) -> Result<String, LlmError> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid("missing choices[0].message.content"))
}

/// `data[0].embedding`.
pub(crate) fn parse_embedding_response(response: &Value) -> Result<Vec<f32>, LlmError> {
    let values = response["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| invalid("missing data[0].embedding"))?;
    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| invalid("non-numeric embedding value")))
        .collect()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_content_extracted() {
        let response = json!({"choices": [{"message": {"role": "assistant", "content": "beach, sunset"}}]});
        assert_eq!(parse_chat_response(&response).unwrap(), "beach, sunset");
        assert!(matches!(
            parse_chat_response(&json!({"choices": []})),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn embedding_extracted() {
        let response = json!({"data": [{"embedding": [0.5, -1.0, 0.25]}]});
        assert_eq!(parse_embedding_response(&response).unwrap(), vec![0.5, -1.0, 0.25]);
        assert!(parse_embedding_response(&json!({"data": [{"embedding": ["x"]}]})).is_err());
    }

    #[test]
    fn non_json_body_is_a_json_error() {
        assert!(matches!(
            parse_body("<html>502 Bad Gateway</html>"),
            Err(LlmError::Json(_))
        ));
        assert_eq!(parse_body(r#"{"ok": true}"#).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn chat_and_embedding_models_reported_separately() {
        let provider = OpenAiProvider::new(&LlmConfig {
            backend: crate::llm::LlmBackend::OpenAi,
            api_key: SecretString::from("sk-test"),
            base_url: "http://localhost:11434/v1/".to_string(),
            model: "llama3".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
        })
        .unwrap();
        assert_eq!(provider.model_name(), "llama3");
        assert_eq!(provider.embedding_model_name(), "nomic-embed-text");
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
