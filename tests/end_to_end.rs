use std::sync::Arc;
use std::time::Duration;

use swarm_ide::agents::llm_agent::LLMAgent;
use swarm_ide::agents::orchestrator::{Orchestrator, OrchestratorSettings};
use swarm_ide::agents::worker::WorkerSettings;
use swarm_ide::agents::{Agent, ResultStatus, Specialization, TaskResult};
use swarm_ide::app::session::{Reply, Session};
use swarm_ide::commands::USAGE;
use swarm_ide::config::{ModelConfig, SwarmConfig};
use swarm_ide::history::{HistoryStore, MemoryHistory, SqliteHistory};
use swarm_ide::providers::{LLMProvider, OfflineProvider, OllamaProvider, ProviderKind};
use tempfile::tempdir;

async fn session(provider: Arc<dyn LLMProvider>, history_path: Option<&std::path::Path>) -> Session {
    let config = ModelConfig::default();
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(LLMAgent::code_generator(provider.clone(), &config)),
        Arc::new(LLMAgent::debugger(provider, &config)),
    ];
    let history: Box<dyn HistoryStore> = match history_path {
        Some(path) => Box::new(SqliteHistory::open(path).await.unwrap()),
        None => Box::new(MemoryHistory::new()),
    };
    let orchestrator = Orchestrator::spawn(
        agents,
        WorkerSettings {
            task_timeout: Duration::from_secs(10),
            ..WorkerSettings::default()
        },
        history,
        OrchestratorSettings::default(),
    )
    .await;
    Session::new(orchestrator, 10).await.unwrap()
}

async fn history_len(session: &mut Session) -> usize {
    match session.handle("history 100").await {
        Reply::History(records) => records.len(),
        other => panic!("expected history, got {:?}", other),
    }
}

fn completed(replies: Vec<Reply>) -> Vec<TaskResult> {
    replies
        .into_iter()
        .filter_map(|r| match r {
            Reply::Completed(result) => Some(result),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn generate_function_is_recorded_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("history.db");
    let mut session = session(Arc::new(OfflineProvider::new()), Some(&path)).await;

    let reply = session.handle("generate function add_two_numbers").await;
    assert!(matches!(
        reply,
        Reply::Accepted {
            specialization: Specialization::CodeGeneration,
            ..
        }
    ));

    let results = completed(session.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Success);
    assert!(results[0].output.contains("add_two_numbers"));
    assert_eq!(history_len(&mut session).await, 1);

    session.shutdown().await;

    // The record is on disk and survives a restart, as do the counters.
    let reopened = SqliteHistory::open(&path).await.unwrap();
    let records = reopened.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.payload, "add_two_numbers");
    assert_eq!(records[0].entry.command, "generate function");

    let states = reopened.worker_states().await.unwrap();
    let codegen = states
        .iter()
        .find(|s| s.specialization == Specialization::CodeGeneration)
        .unwrap();
    assert_eq!(codegen.tasks_completed, 1);
    assert_eq!(codegen.current_status, "stopped");
}

#[tokio::test]
async fn debug_syntax_result_is_always_recorded() {
    let mut session = session(Arc::new(OfflineProvider::new()), None).await;

    let reply = session.handle("debug syntax def f(: pass").await;
    assert!(matches!(
        reply,
        Reply::Accepted {
            specialization: Specialization::Debugging,
            ..
        }
    ));

    let results = completed(session.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].specialization, Specialization::Debugging);
    assert_eq!(history_len(&mut session).await, 1);

    match session.handle("history").await {
        Reply::History(records) => assert_eq!(records[0].entry.payload, "def f(: pass"),
        other => panic!("expected history, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_command_is_rejected_without_side_effects() {
    let mut session = session(Arc::new(OfflineProvider::new()), None).await;

    match session.handle("banana").await {
        Reply::Usage(text) => assert_eq!(text, USAGE),
        other => panic!("expected usage, got {:?}", other),
    }
    assert_eq!(session.pending(), 0);
    assert!(session.poll().await.is_empty());
    assert_eq!(history_len(&mut session).await, 0);
}

#[tokio::test]
async fn unreachable_model_server_fails_the_task_not_the_session() {
    // Nothing listens on the discard port.
    let provider = Arc::new(OllamaProvider::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap());
    let mut session = session(provider, None).await;

    session.handle("generate class file logger").await;
    let results = completed(session.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Error);
    assert!(!results[0].error.as_deref().unwrap_or_default().is_empty());

    // Still accepting work afterwards.
    assert!(matches!(
        session.handle("debug logic while True: pass").await,
        Reply::Accepted { .. }
    ));
    let results = completed(session.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(results.len(), 1);
    assert_eq!(history_len(&mut session).await, 2);

    match session.handle("status").await {
        Reply::Status(workers) => assert!(workers.iter().all(|w| w.alive)),
        other => panic!("expected status, got {:?}", other),
    }
}

#[tokio::test]
async fn session_starts_from_config() {
    let dir = tempdir().unwrap();
    let mut config = SwarmConfig::default();
    config.model.provider = ProviderKind::Offline;
    config.history.path = dir.path().join("history.db");

    let (mut session, notices) = Session::start(&config).await.unwrap();
    assert!(notices.is_empty());

    session.handle("generate code hello world").await;
    let results = completed(session.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    session.shutdown().await;

    // A second session continues the id sequence and the worker totals.
    let (mut session, _) = Session::start(&config).await.unwrap();
    assert!(matches!(
        session.handle("generate code again").await,
        Reply::Accepted { task_id: 2, .. }
    ));
    session.wait_idle(Duration::from_secs(5)).await;
    match session.handle("status").await {
        Reply::Status(workers) => {
            let codegen = workers
                .iter()
                .find(|w| w.specialization == Specialization::CodeGeneration)
                .unwrap();
            assert_eq!(codegen.completed, 2);
        }
        other => panic!("expected status, got {:?}", other),
    }
    session.shutdown().await;
}
