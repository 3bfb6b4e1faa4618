pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One message of the prompt sent to the model, OpenAI chat style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the model backend. A subset of the
/// run configuration; the retry policy stays with the caller.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub token_count: u64,
}

/// Incremental output from a streaming call. `tokens_so_far` is
/// cumulative and monotonically non-decreasing within one call.
#[derive(Debug, Clone)]
pub struct PartialChunk {
    pub text: String,
    pub tokens_so_far: u64,
}

/// Model failures carry their own retry classification: transient errors
/// (network, timeout, rate limit) may be retried by the caller, terminal
/// errors abort immediately.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model failure: {0}")]
    Terminal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Execute one prompt. `on_partial` is invoked for each streamed chunk
    /// in generation order and must not block.
    async fn call(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
        on_partial: &(dyn Fn(PartialChunk) + Send + Sync),
    ) -> Result<ModelOutput, ModelError>;
}
