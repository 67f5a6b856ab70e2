//! AI Transport
//!
//! The conversation engine talks to the model through [`CodexClient`]: a list
//! of chat messages plus encoded context segments in, an ordered stream of
//! [`StreamEvent`]s out. [`OpenAiCompatibleClient`] implements it against any
//! `/chat/completions` endpoint that speaks server-sent events.

use crate::context::ContextSegment;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// One item of a model response stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text
    Token(String),
    /// Final payload; replaces everything streamed so far
    Output(String),
    Done,
}

/// Ordered response stream; an `Err` item ends the exchange
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// AI transport
#[async_trait]
pub trait CodexClient: Send + Sync {
    /// Open a streaming exchange
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        context: Vec<ContextSegment>,
    ) -> Result<TransportStream, TransportError>;

    fn model_name(&self) -> &str;
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key; unset means no auth header
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn role_to_string(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn map_http_error(error: reqwest::Error) -> TransportError {
    if let Some(status) = error.status() {
        map_status(status.as_u16(), &error.to_string())
    } else if error.is_timeout() {
        TransportError::RequestFailed(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        TransportError::RequestFailed(format!("Connection error: {}", error))
    } else {
        TransportError::RequestFailed(format!("HTTP error: {}", error))
    }
}

fn map_status(status: u16, body: &str) -> TransportError {
    match status {
        401 | 403 => TransportError::AuthFailed(format!("Authentication failed: {}", body)),
        429 => TransportError::RateLimit(format!("Rate limit exceeded: {}", body)),
        _ => TransportError::RequestFailed(format!(
            "Request failed with status {}: {}",
            status, body
        )),
    }
}

/// Streaming client for OpenAI-compatible chat endpoints
pub struct OpenAiCompatibleClient {
    client: Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
    temperature: Option<f32>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                TransportError::RequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            client,
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }

    fn wire_messages(messages: Vec<ChatMessage>, context: &[ContextSegment]) -> Vec<WireMessage> {
        let total = context.len();
        let context_messages = context.iter().enumerate().map(|(index, segment)| WireMessage {
            role: "system",
            content: format!(
                "Workspace context (segment {} of {}):\n\n{}",
                index + 1,
                total,
                segment.encoded
            ),
        });
        context_messages
            .chain(messages.into_iter().map(|msg| WireMessage {
                role: role_to_string(msg.role),
                content: msg.content,
            }))
            .collect()
    }
}

#[async_trait]
impl CodexClient for OpenAiCompatibleClient {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        context: Vec<ContextSegment>,
    ) -> Result<TransportStream, TransportError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: Self::wire_messages(messages, &context),
            temperature: self.temperature,
            stream: true,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(url = %url, model = %self.model, segments = context.len(), "Opening stream");
        let response = builder.send().await.map_err(map_http_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, &body));
        }

        Ok(sse_event_stream(response.bytes_stream()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Turn an SSE byte stream into [`StreamEvent`]s
///
/// `[DONE]` yields [`StreamEvent::Done`] and ends the stream. A read error
/// yields one [`TransportError::Interrupted`] and ends the stream.
pub fn sse_event_stream<S, B, E>(bytes: S) -> TransportStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let lines = futures::stream::unfold(
        (bytes, Vec::<u8>::with_capacity(8192), false),
        |(mut bytes, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                        Some(Ok(StreamEvent::Done)) => {
                            return Some((Ok(StreamEvent::Done), (bytes, buffer, true)))
                        }
                        Some(item) => return Some((item, (bytes, buffer, false))),
                        None => continue,
                    }
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        warn!(error = %e, "SSE stream read error");
                        let err = TransportError::Interrupted(e.to_string());
                        return Some((Err(err), (bytes, buffer, true)));
                    }
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        return parse_sse_line(&rest).map(|item| (item, (bytes, buffer, true)));
                    }
                }
            }
        },
    );
    Box::pin(lines)
}

/// Parse one SSE line. `None` for comments, blank lines and chunks without text.
fn parse_sse_line(line: &str) -> Option<Result<StreamEvent, TransportError>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamEvent::Done));
    }

    match serde_json::from_str::<ChunkResponse>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|choice| choice.delta.content)
                .collect();
            (!text.is_empty()).then_some(Ok(StreamEvent::Token(text)))
        }
        Err(e) => Some(Err(TransportError::Protocol(format!(
            "{} in chunk {}",
            e,
            data.chars().take(100).collect::<String>()
        )))),
    }
}
