//! Provider capability shared by every LLM backend.

use async_trait::async_trait;

use crate::error::LlmError;

/// Text generation and embedding behind one interface. Handlers hold an
/// `Arc<dyn LlmProvider>` and never know which backend serves it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Chat model. Folded into cache keys for generated text, so switching
    /// models never serves another model's cached output.
    fn model_name(&self) -> &str;

    /// Model behind [`embed`](Self::embed). Embedding cache keys use this
    /// one; vectors from different models differ in meaning and dimension.
    fn embedding_model_name(&self) -> &str;

    /// Single-turn completion.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}
