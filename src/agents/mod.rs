pub mod llm_agent;
pub mod orchestrator;
pub mod worker;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OrchestratorError;

pub type TaskId = u64;

/// The kind of work an agent worker serves. One worker per specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Specialization {
    CodeGeneration,
    Debugging,
}

impl Specialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::CodeGeneration => "code-generation",
            Specialization::Debugging => "debugging",
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specialization {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "code-generation" => Ok(Specialization::CodeGeneration),
            "debugging" => Ok(Specialization::Debugging),
            other => Err(format!("unknown specialization '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerateTarget {
    Function,
    Class,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugFocus {
    Syntax,
    Logic,
    Code,
}

/// What the user asked for, including the subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "subcommand", rename_all = "lowercase")]
pub enum TaskKind {
    Generate(GenerateTarget),
    Debug(DebugFocus),
}

impl TaskKind {
    pub fn specialization(&self) -> Specialization {
        match self {
            TaskKind::Generate(_) => Specialization::CodeGeneration,
            TaskKind::Debug(_) => Specialization::Debugging,
        }
    }

    /// The command words that produce this kind, e.g. `generate function`.
    pub fn command_line(&self) -> &'static str {
        match self {
            TaskKind::Generate(GenerateTarget::Function) => "generate function",
            TaskKind::Generate(GenerateTarget::Class) => "generate class",
            TaskKind::Generate(GenerateTarget::Code) => "generate code",
            TaskKind::Debug(DebugFocus::Syntax) => "debug syntax",
            TaskKind::Debug(DebugFocus::Logic) => "debug logic",
            TaskKind::Debug(DebugFocus::Code) => "debug code",
        }
    }
}

/// Declaration order is dequeue order, lowest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!(
                "unknown priority '{}', expected low, normal, high or critical",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Done,
    Failed,
}

/// A validated request that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub payload: String,
    pub priority: Priority,
}

impl TaskRequest {
    pub fn new(kind: TaskKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: TaskId, request: TaskRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
        }
    }

    pub fn specialization(&self) -> Specialization {
        self.kind.specialization()
    }
}

/// Hands out task ids. Ids only ever go up, so a sequence seeded past the
/// largest id in the history never reuses one. `next` is `None` once the
/// id space is used up.
#[derive(Debug, Clone)]
pub struct TaskIdSequence {
    next: Option<TaskId>,
}

impl TaskIdSequence {
    pub fn new() -> Self {
        Self { next: Some(1) }
    }

    pub fn starting_after(last: Option<TaskId>) -> Result<Self, OrchestratorError> {
        match last {
            None => Ok(Self::new()),
            Some(id) => id
                .checked_add(1)
                .map(|next| Self { next: Some(next) })
                .ok_or(OrchestratorError::TaskIdsExhausted),
        }
    }

    pub fn next_id(&mut self) -> Result<TaskId, OrchestratorError> {
        let id = self.next.ok_or(OrchestratorError::TaskIdsExhausted)?;
        self.next = id.checked_add(1);
        Ok(id)
    }

    pub fn issue(&mut self, request: TaskRequest) -> Result<Task, OrchestratorError> {
        Ok(Task::new(self.next_id()?, request))
    }
}

impl Default for TaskIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
        }
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResultStatus::Success),
            "error" => Ok(ResultStatus::Error),
            other => Err(format!("unknown result status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub specialization: Specialization,
    pub output: String,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &Task, output: String) -> Self {
        Self {
            task_id: task.id,
            specialization: task.specialization(),
            output,
            status: ResultStatus::Success,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(task: &Task, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task_id: task.id,
            specialization: task.specialization(),
            output: format!("Error: {}", error),
            status: ResultStatus::Error,
            error: Some(error),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// The one capability every worker kind implements.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn specialization(&self) -> Specialization;

    async fn execute(&self, task: &Task) -> Result<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake agents shared by the worker and orchestrator tests.

    use super::*;
    use std::sync::Arc;
    use tokio::sync::{Mutex, Notify};

    pub struct EchoAgent(pub Specialization);

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        fn specialization(&self) -> Specialization {
            self.0
        }

        async fn execute(&self, task: &Task) -> Result<String> {
            Ok(format!("echo: {}", task.payload))
        }
    }

    pub struct FailingAgent(pub Specialization);

    #[async_trait]
    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }

        fn specialization(&self) -> Specialization {
            self.0
        }

        async fn execute(&self, _task: &Task) -> Result<String> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    pub struct PanickingAgent(pub Specialization);

    #[async_trait]
    impl Agent for PanickingAgent {
        fn name(&self) -> &str {
            "panicking"
        }

        fn specialization(&self) -> Specialization {
            self.0
        }

        async fn execute(&self, _task: &Task) -> Result<String> {
            panic!("agent blew up");
        }
    }

    /// Answers like [`EchoAgent`] after a fixed delay.
    pub struct SlowAgent(pub Specialization, pub std::time::Duration);

    #[async_trait]
    impl Agent for SlowAgent {
        fn name(&self) -> &str {
            "slow"
        }

        fn specialization(&self) -> Specialization {
            self.0
        }

        async fn execute(&self, task: &Task) -> Result<String> {
            tokio::time::sleep(self.1).await;
            Ok(format!("echo: {}", task.payload))
        }
    }

    /// Holds every call until `release` is notified and records the order in
    /// which payloads were started.
    pub struct GatedAgent {
        pub specialization: Specialization,
        pub release: Arc<Notify>,
        pub started: Arc<Mutex<Vec<String>>>,
    }

    impl GatedAgent {
        pub fn new(specialization: Specialization) -> Self {
            Self {
                specialization,
                release: Arc::new(Notify::new()),
                started: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Agent for GatedAgent {
        fn name(&self) -> &str {
            "gated"
        }

        fn specialization(&self) -> Specialization {
            self.specialization
        }

        async fn execute(&self, task: &Task) -> Result<String> {
            self.started.lock().await.push(task.payload.clone());
            self.release.notified().await;
            Ok(format!("done: {}", task.payload))
        }
    }
}
