use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tracing::debug;

use super::{ChatMessage, ModelClient, ModelError, ModelOutput, ModelParams, PartialChunk};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Streaming client for any OpenAI-compatible chat completion endpoint.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            client: Client::new(),
        }
    }

    /// Build from SPECRUN_API_BASE / SPECRUN_API_KEY, falling back to
    /// OPENAI_API_KEY and the public OpenAI endpoint.
    pub fn from_env() -> Self {
        let base_url = std::env::var("SPECRUN_API_BASE")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var("SPECRUN_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .unwrap_or_default();
        Self::new(base_url, api_key)
    }
}

fn classify_request_error(e: reqwest::Error) -> ModelError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ModelError::Transient(e.to_string())
    } else {
        ModelError::Terminal(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> ModelError {
    let mut detail = body;
    if detail.len() > 400 {
        detail.truncate(400);
    }
    let msg = format!("API error {}: {}", status.as_u16(), detail);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ModelError::Transient(msg)
    } else {
        ModelError::Terminal(msg)
    }
}

// Rough token estimate for streamed deltas; the wire protocol does not
// report usage until the stream ends.
fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as u64) / 4).max(1)
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn call(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
        on_partial: &(dyn Fn(PartialChunk) + Send + Sync),
    ) -> Result<ModelOutput, ModelError> {
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();

        let req = ChatRequest {
            model: &params.model,
            messages: wire_messages,
            stream: true,
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.seed,
            max_tokens: params.max_tokens,
        };

        let mut request = self.client.post(&self.base_url).json(&req);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let res = request.send().await.map_err(classify_request_error)?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        // Read the SSE stream line-by-line
        let stream = res.bytes_stream();
        let reader =
            tokio_util::io::StreamReader::new(stream.map(|r| r.map_err(std::io::Error::other)));
        let mut buf_reader = tokio::io::BufReader::new(reader);
        let mut line_buf = String::new();
        let mut text = String::new();
        let mut tokens = 0u64;

        loop {
            line_buf.clear();
            match buf_reader.read_line(&mut line_buf).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let line = line_buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    // SSE lines: "data: {...}"
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break;
                    }
                    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data)
                        && let Some(delta) =
                            chunk.choices.into_iter().next().and_then(|c| c.delta.content)
                        && !delta.is_empty()
                    {
                        tokens += estimate_tokens(&delta);
                        text.push_str(&delta);
                        on_partial(PartialChunk {
                            text: delta,
                            tokens_so_far: tokens,
                        });
                    }
                }
                Err(e) => {
                    return Err(ModelError::Transient(format!("stream interrupted: {e}")));
                }
            }
        }

        debug!("model call complete ({} tokens estimated)", tokens);
        Ok(ModelOutput {
            text,
            token_count: tokens,
        })
    }
}
