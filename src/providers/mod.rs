use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::TaskKind;
use crate::config::ModelConfig;

pub mod offline;
pub mod ollama;
pub mod openai_compatible;

pub use offline::OfflineProvider;
pub use ollama::OllamaProvider;
pub use openai_compatible::OpenAICompatibleProvider;

/// Represents a message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// The command a request was built from. Remote providers ignore it; the
/// offline provider uses it in place of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub kind: TaskKind,
    pub payload: String,
}

/// Request for a completion
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub task: Option<TaskContext>,
}

impl CompletionRequest {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
    }

    /// All non-system messages joined into one prompt, for endpoints that
    /// take a single prompt string.
    pub fn prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Response from a completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("cannot reach model server: {0}")]
    Network(String),

    #[error("model server did not answer within {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("model server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response from model server: {0}")]
    MalformedResponse(String),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

impl ProviderError {
    /// Sorts a transport error into the variant a user can act on.
    pub(crate) fn from_transport(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else if e.is_decode() {
            ProviderError::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Api {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Main trait that all LLM providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Complete a prompt (non-streaming)
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Cheap reachability check used at startup.
    async fn ping(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "openai-compatible")]
    OpenAICompatible,
    #[serde(rename = "offline")]
    Offline,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAICompatible => "openai-compatible",
            ProviderKind::Offline => "offline",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai-compatible" | "openai" => Ok(ProviderKind::OpenAICompatible),
            "offline" => Ok(ProviderKind::Offline),
            other => Err(format!(
                "unknown provider '{}' (expected ollama, openai-compatible or offline)",
                other
            )),
        }
    }
}

pub fn build_provider(config: &ModelConfig) -> Result<Arc<dyn LLMProvider>, ProviderError> {
    let provider: Arc<dyn LLMProvider> = match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(&config.base_url, config.timeout())?),
        ProviderKind::OpenAICompatible => Arc::new(OpenAICompatibleProvider::new(
            &config.base_url,
            config.timeout(),
        )?),
        ProviderKind::Offline => Arc::new(OfflineProvider::new()),
    };
    Ok(provider)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::InvalidConfig(e.to_string()))
}

/// Validates and normalizes a base URL, dropping any trailing slash.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<String, ProviderError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ProviderError::InvalidConfig(format!(
            "base URL must start with http:// or https://, got '{}'",
            base_url
        )));
    }
    Ok(trimmed.to_string())
}

/// Turns a non-2xx response into [`ProviderError::Api`].
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}
