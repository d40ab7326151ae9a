//! Backend client
//!
//! `LlmClient` is the seam the engine talks through; `HttpLlmClient` is
//! the production implementation speaking any OpenAI-compatible
//! chat/completions endpoint over SSE.

use std::sync::RwLock;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::retry::{with_rate_limit_retry, RetryConfig};
use super::types::{ChatMessage, ChatResponse, StreamEvent, ToolSchema, Usage};

/// Transport-level client errors. `RateLimited` is the only retryable kind.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limited by backend")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(String),
}

impl ClientError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ClientError::RateLimited)
    }
}

/// Per-call request options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub tools: Option<Vec<ToolSchema>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

/// Contract the engine consumes. Implementations must be cheap to clone
/// behind an `Arc` and safe to probe with a low-budget call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatResponse, ClientError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ClientError>;

    fn supports_tools(&self) -> bool;
    fn set_model(&self, model: String);
    fn current_model(&self) -> String;
    fn backend_name(&self) -> String;
    fn base_url(&self) -> String;
}

/// Connection profile for one backend.
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub name: String,
    pub base_url: String,
    pub api_key_env_var: String,
    pub model: String,
    pub supports_tools: bool,
}

/// OpenAI-compatible HTTP client.
pub struct HttpLlmClient {
    http: reqwest::Client,
    profile: BackendProfile,
    model: RwLock<String>,
    retry: RetryConfig,
}

impl HttpLlmClient {
    pub fn new(profile: BackendProfile) -> Self {
        let model = profile.model.clone();
        Self {
            http: reqwest::Client::new(),
            profile,
            model: RwLock::new(model),
            retry: RetryConfig::default(),
        }
    }

    fn api_key(&self) -> Result<String, ClientError> {
        std::env::var(&self.profile.api_key_env_var)
            .map_err(|_| ClientError::MissingApiKey(self.profile.api_key_env_var.clone()))
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.profile.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, messages: &[ChatMessage], options: &CallOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": self.current_model(),
            "messages": messages,
            "stream": stream,
        });
        if let Some(tools) = &options.tools {
            if !tools.is_empty() {
                let defs: Vec<Value> = tools
                    .iter()
                    .map(|t| json!({ "type": "function", "function": t }))
                    .collect();
                body["tools"] = Value::Array(defs);
            }
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ClientError> {
        let key = self.api_key()?;
        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(backend = %self.profile.name, status = status.as_u16(), "backend request failed");
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatResponse, ClientError> {
        let body = self.build_body(messages, options, false);
        let start = Instant::now();
        info!(
            backend = %self.profile.name,
            model = %self.current_model(),
            messages = messages.len(),
            "chat request"
        );

        let response = with_rate_limit_retry(&self.retry, "chat", || self.post(&body)).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("invalid response body: {e}")))?;

        info!(
            backend = %self.profile.name,
            choices = parsed.choices.len(),
            elapsed = ?start.elapsed(),
            "chat response"
        );
        Ok(parsed)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ClientError> {
        let body = self.build_body(messages, options, true);
        let response = with_rate_limit_retry(&self.retry, "chat_stream", || self.post(&body)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let backend = self.profile.name.clone();
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(backend = %backend, "stream read error: {}", e);
                        let _ = tx.send(StreamEvent::Error(format!("stream read error: {e}")));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if !forward_sse_line(&line, &tx) {
                        return;
                    }
                }
            }
            debug!(backend = %backend, "stream ended");
            let _ = tx.send(StreamEvent::Done);
        });

        Ok(rx)
    }

    fn supports_tools(&self) -> bool {
        self.profile.supports_tools
    }

    fn set_model(&self, model: String) {
        if let Ok(mut current) = self.model.write() {
            *current = model;
        }
    }

    fn current_model(&self) -> String {
        self.model
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|_| self.profile.model.clone())
    }

    fn backend_name(&self) -> String {
        self.profile.name.clone()
    }

    fn base_url(&self) -> String {
        self.profile.base_url.clone()
    }
}

/// Forward one SSE line to the event channel. Returns false once the
/// stream is finished and the reader task should stop.
fn forward_sse_line(line: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    let Some(data) = line.strip_prefix("data:") else {
        return true;
    };
    let data = data.trim();
    if data.is_empty() {
        return true;
    }
    if data == "[DONE]" {
        let _ = tx.send(StreamEvent::Done);
        return false;
    }

    let json: Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            let _ = tx.send(StreamEvent::Error(format!("malformed stream chunk: {e}")));
            return false;
        }
    };

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown backend error");
        let _ = tx.send(StreamEvent::Error(message.to_string()));
        return false;
    }

    if let Some(usage) = json.get("usage") {
        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
            if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
                let _ = tx.send(StreamEvent::Usage(usage));
            }
        }
    }

    if let Some(delta) = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
    {
        if !delta.is_null() {
            let _ = tx.send(StreamEvent::Delta(delta.clone()));
        }
    }

    true
}
