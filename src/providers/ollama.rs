use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{
    ensure_success, http_client, normalize_base_url, CompletionRequest, CompletionResponse,
    LLMProvider, ProviderError, TokenUsage,
};

/// Native Ollama client using `/api/generate` without streaming.
pub struct OllamaProvider {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            timeout,
            client: http_client(timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &request.model,
            prompt: request.prompt(),
            system: request.system_prompt(),
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        debug!(%url, model = %request.model, "sending generate request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(e, self.timeout))?;
        let response = ensure_success(response).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let content = parsed
            .response
            .ok_or_else(|| ProviderError::MalformedResponse("missing 'response' field".to_string()))?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (Some(prompt), Some(completion)) => Some(TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }),
            _ => None,
        };

        Ok(CompletionResponse {
            content,
            model: parsed.model.unwrap_or(request.model),
            usage,
        })
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
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
