use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Agent, DebugFocus, GenerateTarget, Specialization, Task, TaskKind};
use crate::config::ModelConfig;
use crate::providers::{CompletionRequest, LLMProvider, Message, TaskContext};

const CODE_GENERATOR_SYSTEM: &str = "You are a senior software engineer. You write clean, idiomatic, \
production-quality code and reply with code only.";

const DEBUGGER_SYSTEM: &str = "You are a meticulous code reviewer. You find defects in the code you \
are given and reply with a concise analysis only.";

/// An agent that turns a task into a prompt and hands it to a model provider.
pub struct LLMAgent {
    name: String,
    specialization: Specialization,
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    language: String,
}

impl LLMAgent {
    pub fn code_generator(provider: Arc<dyn LLMProvider>, config: &ModelConfig) -> Self {
        Self::new("code-gen", Specialization::CodeGeneration, provider, config)
    }

    pub fn debugger(provider: Arc<dyn LLMProvider>, config: &ModelConfig) -> Self {
        Self::new("debug", Specialization::Debugging, provider, config)
    }

    fn new(
        name: &str,
        specialization: Specialization,
        provider: Arc<dyn LLMProvider>,
        config: &ModelConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            specialization,
            provider,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            language: config.language.clone(),
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self.specialization {
            Specialization::CodeGeneration => CODE_GENERATOR_SYSTEM,
            Specialization::Debugging => DEBUGGER_SYSTEM,
        }
    }

    /// The instruction sent for `task`.
    pub fn instruction(&self, task: &Task) -> String {
        let lang = &self.language;
        let payload = &task.payload;
        let code_only = "Return only the code, no explanations, no conversational text, \
                         no markdown formatting outside of the code block itself.";
        let analysis_only = "Return only the analysis, no code or explanations, no conversational text.";

        match task.kind {
            TaskKind::Generate(GenerateTarget::Function) => format!(
                "Generate a {lang} function for '{payload}'. Include error handling and type hints. \
                 Follow the language's standard style. {code_only}"
            ),
            TaskKind::Generate(GenerateTarget::Class) => format!(
                "Generate a {lang} class for '{payload}'. Include error handling and type hints. \
                 Follow the language's standard style. {code_only}"
            ),
            TaskKind::Generate(GenerateTarget::Code) => format!(
                "Generate {lang} code for '{payload}'. Include input validation and error handling. \
                 Follow the language's standard style. {code_only}"
            ),
            TaskKind::Debug(DebugFocus::Syntax) => format!(
                "Analyze this {lang} code for syntax errors:\n```\n{payload}\n```\n{analysis_only}"
            ),
            TaskKind::Debug(DebugFocus::Logic) => format!(
                "Analyze this {lang} code for logical errors and potential issues \
                 (e.g., edge cases, performance):\n```\n{payload}\n```\n{analysis_only}"
            ),
            TaskKind::Debug(DebugFocus::Code) => format!(
                "Analyze this {lang} code for any errors, bugs or risky constructs:\n```\n{payload}\n```\n{analysis_only}"
            ),
        }
    }
}

#[async_trait]
impl Agent for LLMAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn specialization(&self) -> Specialization {
        self.specialization
    }

    async fn execute(&self, task: &Task) -> Result<String> {
        let request = CompletionRequest {
            messages: vec![
                Message::system(self.system_prompt()),
                Message::user(self.instruction(task)),
            ],
            model: self.model.clone(),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            task: Some(TaskContext {
                kind: task.kind,
                payload: task.payload.clone(),
            }),
        };

        debug!(
            task_id = task.id,
            agent = %self.name,
            provider = self.provider.name(),
            model = %self.model,
            "calling model"
        );
        let response = self
            .provider
            .complete(request)
            .await
            .with_context(|| format!("{} request failed", self.provider.name()))?;

        let content = response.content.trim();
        if content.is_empty() {
            anyhow::bail!("model returned an empty response");
        }
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::TaskRequest;
    use crate::providers::{CompletionResponse, OfflineProvider, ProviderError};
    use std::sync::Mutex;

    /// Records the last request and replies with a fixed string.
    struct ScriptedProvider {
        reply: Result<String, String>,
        seen: Mutex<Option<CompletionRequest>>,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            let model = request.model.clone();
            *self.seen.lock().unwrap() = Some(request);
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    model,
                    usage: None,
                }),
                Err(msg) => Err(ProviderError::Network(msg.clone())),
            }
        }

        async fn ping(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn scripted(reply: Result<&str, &str>) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider {
            reply: reply.map(str::to_string).map_err(str::to_string),
            seen: Mutex::new(None),
        })
    }

    fn task(kind: TaskKind, payload: &str) -> Task {
        Task::new(1, TaskRequest::new(kind, payload))
    }

    #[tokio::test]
    async fn test_generator_builds_prompt_from_payload() {
        let provider = scripted(Ok("  def add(a, b): return a + b\n"));
        let mut config = ModelConfig::default();
        config.language = "Python".to_string();
        let agent = LLMAgent::code_generator(provider.clone(), &config);

        let output = agent
            .execute(&task(TaskKind::Generate(GenerateTarget::Function), "add_two_numbers"))
            .await
            .unwrap();
        assert_eq!(output, "def add(a, b): return a + b");

        let seen = provider.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.model, "mistral");
        assert_eq!(seen.system_prompt(), Some(CODE_GENERATOR_SYSTEM));
        assert!(seen.prompt().contains("Python function for 'add_two_numbers'"));
        assert_eq!(seen.max_tokens, Some(2048));
    }

    #[tokio::test]
    async fn test_debugger_embeds_code() {
        let provider = scripted(Ok("Missing ')'"));
        let agent = LLMAgent::debugger(provider.clone(), &ModelConfig::default());
        assert_eq!(agent.specialization(), Specialization::Debugging);

        agent
            .execute(&task(TaskKind::Debug(DebugFocus::Logic), "while True: pass"))
            .await
            .unwrap();

        let seen = provider.seen.lock().unwrap().clone().unwrap();
        let prompt = seen.prompt();
        assert!(prompt.contains("logical errors"));
        assert!(prompt.contains("while True: pass"));
    }

    #[tokio::test]
    async fn test_provider_error_is_propagated() {
        let agent = LLMAgent::code_generator(scripted(Err("connection refused")), &ModelConfig::default());
        let err = agent
            .execute(&task(TaskKind::Generate(GenerateTarget::Code), "jwt login"))
            .await
            .unwrap_err();
        let detail = format!("{:#}", err);
        assert!(detail.contains("scripted request failed"));
        assert!(detail.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_blank_reply_is_an_error() {
        let agent = LLMAgent::debugger(scripted(Ok("   \n")), &ModelConfig::default());
        let result = agent
            .execute(&task(TaskKind::Debug(DebugFocus::Syntax), "x = ("))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_works_with_offline_provider() {
        let agent = LLMAgent::code_generator(Arc::new(OfflineProvider::new()), &ModelConfig::default());
        let output = agent
            .execute(&task(TaskKind::Generate(GenerateTarget::Class), "file logger"))
            .await
            .unwrap();
        assert!(output.starts_with("class FileLogger:"));
    }
}
