use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::agents::llm_agent::LLMAgent;
use crate::agents::orchestrator::{Orchestrator, WorkerStatus};
use crate::agents::{Agent, Priority, Specialization, TaskId, TaskIdSequence, TaskResult};
use crate::commands::{self, Command, USAGE};
use crate::config::SwarmConfig;
use crate::error::OrchestratorError;
use crate::history::{self, HistoryRecord};
use crate::providers;

/// Everything the front ends can be asked to show.
#[derive(Debug)]
pub enum Reply {
    Usage(&'static str),
    Help(&'static str),
    Accepted {
        task_id: TaskId,
        specialization: Specialization,
        command: &'static str,
    },
    DispatchFailed(OrchestratorError),
    Status(Vec<WorkerStatus>),
    History(Vec<HistoryRecord>),
    Completed(TaskResult),
    Notice(String),
    Quit,
}

/// One interactive session: parses lines, hands tasks to the orchestrator and
/// turns whatever comes back into [`Reply`] values.
pub struct Session {
    orchestrator: Orchestrator,
    ids: TaskIdSequence,
    history_limit: usize,
    priority: Priority,
}

impl Session {
    /// Continues the task id sequence after the largest id in the history.
    pub async fn new(orchestrator: Orchestrator, history_limit: usize) -> Result<Self> {
        let last = orchestrator
            .last_recorded_task_id()
            .await
            .context("Failed to read the last recorded task id")?;
        let ids = TaskIdSequence::starting_after(last)?;
        Ok(Self {
            orchestrator,
            ids,
            history_limit: history_limit.max(1),
            priority: Priority::default(),
        })
    }

    /// Priority given to every task accepted from now on.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Builds the provider, agents, workers and history store described by
    /// `config`. Problems that do not stop the session are returned as
    /// notices.
    pub async fn start(config: &SwarmConfig) -> Result<(Self, Vec<Reply>)> {
        let mut notices = Vec::new();

        let provider = providers::build_provider(&config.model)
            .context("Failed to set up the model provider")?;
        match provider.ping().await {
            Ok(()) => info!(provider = provider.name(), url = %config.model.base_url, "model server reachable"),
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "model server check failed");
                notices.push(Reply::Notice(format!(
                    "{} at {} is not answering ({}). Tasks will fail until it is up.",
                    provider.name(),
                    config.model.base_url,
                    e
                )));
            }
        }

        let store = history::open_store(&config.history.path)
            .await
            .with_context(|| {
                format!("Failed to open history at {}", config.history.path.display())
            })?;

        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(LLMAgent::code_generator(provider.clone(), &config.model)),
            Arc::new(LLMAgent::debugger(provider, &config.model)),
        ];
        let orchestrator = Orchestrator::spawn(
            agents,
            config.orchestrator.worker_settings(),
            store,
            config.orchestrator.orchestrator_settings(),
        )
        .await;

        let mut session = Self::new(orchestrator, config.history.default_limit).await?;
        session.set_priority(config.orchestrator.default_priority);
        Ok((session, notices))
    }

    pub async fn handle(&mut self, line: &str) -> Reply {
        let command = match commands::parse(line) {
            Ok(command) => command,
            Err(rejection) => return Reply::Usage(rejection.usage()),
        };

        match command {
            Command::Help => Reply::Help(USAGE),
            Command::Quit => Reply::Quit,
            Command::Status => Reply::Status(self.orchestrator.status()),
            Command::History { limit } => {
                match self.orchestrator.history(limit.unwrap_or(self.history_limit)).await {
                    Ok(records) => Reply::History(records),
                    Err(e) => {
                        warn!(error = %e, "history lookup failed");
                        Reply::Notice(format!("Could not read history: {}", e))
                    }
                }
            }
            task_command => {
                let Some(request) = task_command.into_request() else {
                    return Reply::Usage(USAGE);
                };
                let task = match self.ids.issue(request.with_priority(self.priority)) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(error = %e, "no task id available");
                        return Reply::DispatchFailed(e);
                    }
                };
                let (task_id, specialization, command) =
                    (task.id, task.specialization(), task.kind.command_line());

                match self.orchestrator.dispatch(task) {
                    Ok(()) => Reply::Accepted {
                        task_id,
                        specialization,
                        command,
                    },
                    Err(e) => {
                        warn!(task_id, error = %e, "dispatch failed");
                        Reply::DispatchFailed(e)
                    }
                }
            }
        }
    }

    /// Results that have arrived since the last poll. Never waits on a
    /// worker.
    pub async fn poll(&mut self) -> Vec<Reply> {
        self.orchestrator
            .collect()
            .await
            .into_iter()
            .map(Reply::Completed)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.orchestrator.outstanding()
    }

    /// Polls until nothing is outstanding or `timeout` passes.
    pub async fn wait_idle(&mut self, timeout: Duration) -> Vec<Reply> {
        let deadline = Instant::now() + timeout;
        let mut replies = self.poll().await;
        while self.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            replies.extend(self.poll().await);
        }
        replies
    }

    /// Stops every worker. Anything still running is reported as failed.
    pub async fn shutdown(self) -> Vec<Reply> {
        self.orchestrator
            .shutdown()
            .await
            .into_iter()
            .map(Reply::Completed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::orchestrator::OrchestratorSettings;
    use crate::agents::testing::{EchoAgent, GatedAgent};
    use crate::agents::worker::WorkerSettings;
    use crate::history::{HistoryEntry, HistoryStore, MemoryHistory};

    async fn session_with(agents: Vec<Arc<dyn Agent>>, history: MemoryHistory) -> Session {
        let orchestrator = Orchestrator::spawn(
            agents,
            WorkerSettings::default(),
            Box::new(history),
            OrchestratorSettings::default(),
        )
        .await;
        Session::new(orchestrator, 10).await.unwrap()
    }

    async fn seeded_history(task_id: TaskId) -> MemoryHistory {
        let history = MemoryHistory::new();
        let seed = crate::agents::Task::new(
            task_id,
            crate::agents::TaskRequest::new(
                crate::agents::TaskKind::Generate(crate::agents::GenerateTarget::Code),
                "seed",
            ),
        );
        let result = TaskResult::success(&seed, "ok".to_string());
        history
            .append(HistoryEntry::from_outcome(&seed, &result))
            .await
            .unwrap();
        history
    }

    #[tokio::test]
    async fn test_rejected_line_creates_no_task() {
        let mut session = session_with(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            MemoryHistory::new(),
        )
        .await;
        assert!(matches!(session.handle("banana").await, Reply::Usage(USAGE)));
        assert_eq!(session.pending(), 0);
        assert!(matches!(session.handle("history").await, Reply::History(h) if h.is_empty()));
    }

    #[tokio::test]
    async fn test_accepted_task_completes() {
        let mut session = session_with(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            MemoryHistory::new(),
        )
        .await;

        match session.handle("generate function add_two_numbers").await {
            Reply::Accepted {
                task_id,
                specialization,
                command,
            } => {
                assert_eq!(task_id, 1);
                assert_eq!(specialization, Specialization::CodeGeneration);
                assert_eq!(command, "generate function");
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let replies = session.wait_idle(Duration::from_secs(5)).await;
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], Reply::Completed(r) if r.output == "echo: add_two_numbers"));
    }

    #[tokio::test]
    async fn test_missing_worker_is_reported() {
        let mut session = session_with(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            MemoryHistory::new(),
        )
        .await;
        assert!(matches!(
            session.handle("debug syntax x = (").await,
            Reply::DispatchFailed(OrchestratorError::UnknownSpecialization(Specialization::Debugging))
        ));
    }

    #[tokio::test]
    async fn test_ids_continue_after_history() {
        let mut session = session_with(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            seeded_history(41).await,
        )
        .await;
        assert!(matches!(
            session.handle("generate code hello").await,
            Reply::Accepted { task_id: 42, .. }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_id_space_refuses_to_start() {
        let orchestrator = Orchestrator::spawn(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            WorkerSettings::default(),
            Box::new(seeded_history(TaskId::MAX).await),
            OrchestratorSettings::default(),
        )
        .await;
        let err = Session::new(orchestrator, 10).await.err().unwrap();
        assert!(err.to_string().contains("no task ids left"));
    }

    #[tokio::test]
    async fn test_last_id_is_issued_once() {
        let mut session = session_with(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            seeded_history(TaskId::MAX - 1).await,
        )
        .await;
        assert!(matches!(
            session.handle("generate code last").await,
            Reply::Accepted { task_id, .. } if task_id == TaskId::MAX
        ));
        assert!(matches!(
            session.handle("generate code one more").await,
            Reply::DispatchFailed(OrchestratorError::TaskIdsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_critical_task_jumps_the_queue() {
        let agent = Arc::new(GatedAgent::new(Specialization::CodeGeneration));
        let started = agent.started.clone();
        let release = agent.release.clone();
        let mut session = session_with(vec![agent], MemoryHistory::new()).await;

        assert!(matches!(session.handle("generate code first").await, Reply::Accepted { .. }));
        while started.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The worker is busy, so these three wait in its queue.
        session.handle("generate code normal one").await;
        session.handle("generate code normal two").await;
        session.set_priority(Priority::Critical);
        session.handle("generate code urgent").await;

        for _ in 0..4 {
            release.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let replies = session.wait_idle(Duration::from_secs(5)).await;
        assert_eq!(replies.len(), 4);
        assert_eq!(
            *started.lock().await,
            vec!["first", "urgent", "normal one", "normal two"]
        );
    }

    #[tokio::test]
    async fn test_utility_replies() {
        let mut session = session_with(
            vec![
                Arc::new(EchoAgent(Specialization::CodeGeneration)),
                Arc::new(EchoAgent(Specialization::Debugging)),
            ],
            MemoryHistory::new(),
        )
        .await;
        assert!(matches!(session.handle("help").await, Reply::Help(_)));
        assert!(matches!(session.handle("quit").await, Reply::Quit));
        assert!(matches!(session.handle("status").await, Reply::Status(s) if s.len() == 2));
    }

    #[tokio::test]
    async fn test_shutdown_reports_stuck_task() {
        let agent = Arc::new(GatedAgent::new(Specialization::CodeGeneration));
        let orchestrator = Orchestrator::spawn(
            vec![agent],
            WorkerSettings::default(),
            Box::new(MemoryHistory::new()),
            OrchestratorSettings {
                shutdown_grace: Duration::from_millis(100),
                ..OrchestratorSettings::default()
            },
        )
        .await;
        let mut session = Session::new(orchestrator, 10).await.unwrap();

        session.handle("generate class logger").await;
        let replies = session.shutdown().await;
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], Reply::Completed(r) if !r.is_success()));
    }
}
