use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{
    ensure_success, http_client, normalize_base_url, CompletionRequest, CompletionResponse,
    LLMProvider, ProviderError, TokenUsage,
};

/// OpenAI-compatible provider for local servers (LM Studio, llama.cpp,
/// vLLM, Ollama's `/v1` surface).
pub struct OpenAICompatibleProvider {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            timeout,
            client: http_client(timeout)?,
        })
    }
}

// OpenAI API structures
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };
        debug!(%url, model = %request.model, messages = body.messages.len(), "sending chat completion");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(e, self.timeout))?;
        let response = ensure_success(response).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse("no choices in response".to_string()))?;

        Ok(CompletionResponse {
            content,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout.min(Duration::from_secs(5)))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(e, self.timeout))?;
        ensure_success(response).await.map(|_| ())
    }
}
