use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::orchestrator::OrchestratorSettings;
use crate::agents::Priority;
use crate::agents::worker::WorkerSettings;
use crate::providers::ProviderKind;

pub const ENV_BASE_URL: &str = "OLLAMA_BASE_URL";
pub const ENV_MODEL: &str = "SWARM_MODEL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub model: ModelConfig,
    pub orchestrator: OrchestratorConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Programming language named in generation and review prompts.
    pub language: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "mistral".to_string(),
            timeout_secs: 30,
            temperature: 0.7,
            max_tokens: 2048,
            language: "Python".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub task_timeout_secs: u64,
    /// Priority given to tasks typed at the prompt.
    pub default_priority: Priority,
    /// Settled task statuses kept for lookup by id.
    pub status_retention: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 16,
            outbound_capacity: 64,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_secs: 10,
            shutdown_grace_secs: 5,
            task_timeout_secs: 120,
            default_priority: Priority::Normal,
            status_retention: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            inbound_capacity: self.inbound_capacity,
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            status_retention: self.status_retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: PathBuf,
    /// Records shown by a bare `history` command.
    pub default_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("swarm-ide").join("history.db"),
            default_limit: 10,
        }
    }
}

impl SwarmConfig {
    /// Loads the config from the default location, writing the defaults there
    /// on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".config").join("swarm-ide").join("config.toml"))
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Applies environment overrides read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_BASE_URL) {
            self.model.base_url = url;
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.model.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.inbound_capacity == 0 || o.outbound_capacity == 0 {
            bail!("orchestrator channel capacities must be at least 1");
        }
        if o.heartbeat_interval_ms == 0 {
            bail!("orchestrator.heartbeat_interval_ms must be at least 1");
        }
        if Duration::from_secs(o.heartbeat_timeout_secs) <= Duration::from_millis(o.heartbeat_interval_ms) {
            bail!(
                "orchestrator.heartbeat_timeout_secs ({}s) must be longer than the heartbeat interval ({}ms)",
                o.heartbeat_timeout_secs,
                o.heartbeat_interval_ms
            );
        }
        if o.task_timeout_secs == 0 {
            bail!("orchestrator.task_timeout_secs must be at least 1");
        }
        if self.model.model.trim().is_empty() {
            bail!("model.model must name a model");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            bail!("model.temperature must be between 0.0 and 2.0");
        }
        if self.history.default_limit == 0 {
            bail!("history.default_limit must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.model.provider, ProviderKind::Ollama);
        assert_eq!(config.model.base_url, "http://localhost:11434");
        assert_eq!(config.orchestrator.inbound_capacity, 16);
        assert!(config.history.path.ends_with("swarm-ide/history.db"));
        assert_eq!(config.orchestrator.default_priority, Priority::Normal);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[model]\nprovider = \"openai-compatible\"\nbase_url = \"http://localhost:1234\"\n\n[orchestrator]\ninbound_capacity = 4\ndefault_priority = \"high\"\n",
        )
        .unwrap();

        let config = SwarmConfig::load_from(&path).unwrap();
        assert_eq!(config.model.provider, ProviderKind::OpenAICompatible);
        assert_eq!(config.model.base_url, "http://localhost:1234");
        assert_eq!(config.model.model, "mistral");
        assert_eq!(config.orchestrator.inbound_capacity, 4);
        assert_eq!(config.orchestrator.outbound_capacity, 64);
        assert_eq!(config.orchestrator.default_priority, Priority::High);
        assert_eq!(config.orchestrator.status_retention, 1024);
        assert_eq!(config.history.default_limit, 10);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SwarmConfig::default();
        config.model.language = "Rust".to_string();
        config.history.path = dir.path().join("h.db");
        config.orchestrator.default_priority = Priority::Critical;

        config.save_to(&path).unwrap();
        assert_eq!(SwarmConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_toml_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[model\nprovider = 3").unwrap();

        let err = SwarmConfig::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SwarmConfig::default();
        config.apply_env_with(|key| match key {
            ENV_BASE_URL => Some("http://gpu-box:11434".to_string()),
            ENV_MODEL => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.model.base_url, "http://gpu-box:11434");
        assert_eq!(config.model.model, "mistral");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SwarmConfig::default();
        config.orchestrator.inbound_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.orchestrator.heartbeat_interval_ms = 10_000;
        config.orchestrator.heartbeat_timeout_secs = 10;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.model.model = String::new();
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.history.default_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let config = OrchestratorConfig {
            heartbeat_interval_ms: 250,
            task_timeout_secs: 7,
            ..OrchestratorConfig::default()
        };
        let worker = config.worker_settings();
        assert_eq!(worker.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(worker.task_timeout, Duration::from_secs(7));
        assert_eq!(
            config.orchestrator_settings().shutdown_grace,
            Duration::from_secs(5)
        );
        assert_eq!(config.orchestrator_settings().status_retention, 1024);
    }
}
