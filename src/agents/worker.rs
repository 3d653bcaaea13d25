use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Agent, Specialization, Task, TaskId, TaskResult};

/// Orchestrator to worker.
#[derive(Debug)]
pub enum WorkerMessage {
    Task(Task),
    Stop,
}

/// Worker to orchestrator.
#[derive(Debug)]
pub enum WorkerEvent {
    Started { task_id: TaskId, at: DateTime<Utc> },
    Heartbeat { at: DateTime<Utc> },
    Completed(TaskResult),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
    pub task_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 16,
            outbound_capacity: 64,
            heartbeat_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything the orchestrator holds for one running worker. The worker side
/// owns the other ends of both channels; nothing else is shared.
pub struct WorkerHandle {
    pub id: Uuid,
    pub name: String,
    pub specialization: Specialization,
    pub(crate) inbound: mpsc::Sender<WorkerMessage>,
    pub(crate) outbound: mpsc::Receiver<WorkerEvent>,
    pub(crate) join: JoinHandle<()>,
    pub(crate) capacity: usize,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Starts the actor loop for `agent` on the current tokio runtime.
pub fn spawn_worker(agent: Arc<dyn Agent>, settings: WorkerSettings) -> WorkerHandle {
    let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));

    let id = Uuid::new_v4();
    let name = agent.name().to_string();
    let specialization = agent.specialization();
    let capacity = settings.inbound_capacity.max(1);

    let join = tokio::spawn(run_worker(agent, inbound_rx, outbound_tx, settings));
    info!(worker = %name, %specialization, %id, "worker started");

    WorkerHandle {
        id,
        name,
        specialization,
        inbound: inbound_tx,
        outbound: outbound_rx,
        join,
        capacity,
    }
}

struct Pending {
    seq: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

async fn run_worker(
    agent: Arc<dyn Agent>,
    mut inbound: mpsc::Receiver<WorkerMessage>,
    outbound: mpsc::Sender<WorkerEvent>,
    settings: WorkerSettings,
) {
    let mut pending: BinaryHeap<Pending> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut heartbeat = time::interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'serve: loop {
        if pending.is_empty() {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(WorkerMessage::Task(task)) => {
                        seq += 1;
                        pending.push(Pending { seq, task });
                    }
                    Some(WorkerMessage::Stop) | None => break 'serve,
                },
                _ = heartbeat.tick() => {
                    beat(&outbound);
                    continue 'serve;
                }
            }
        }

        loop {
            match inbound.try_recv() {
                Ok(WorkerMessage::Task(task)) => {
                    seq += 1;
                    pending.push(Pending { seq, task });
                }
                Ok(WorkerMessage::Stop) => {
                    abandon(&mut pending, &outbound).await;
                    break 'serve;
                }
                Err(_) => break,
            }
        }

        let Some(Pending { task, .. }) = pending.pop() else {
            continue;
        };

        let started = WorkerEvent::Started {
            task_id: task.id,
            at: Utc::now(),
        };
        if outbound.send(started).await.is_err() {
            break;
        }

        let result = execute(agent.as_ref(), &task, &outbound, &mut heartbeat, &settings).await;
        if outbound.send(WorkerEvent::Completed(result)).await.is_err() {
            warn!(task_id = task.id, "orchestrator went away, dropping worker");
            break;
        }
    }

    info!(worker = agent.name(), "worker stopped");
}

/// Runs one task to completion, keeping the heartbeat going while the agent
/// call is outstanding. Errors, timeouts and panics all become failed results.
async fn execute(
    agent: &dyn Agent,
    task: &Task,
    outbound: &mpsc::Sender<WorkerEvent>,
    heartbeat: &mut time::Interval,
    settings: &WorkerSettings,
) -> TaskResult {
    debug!(task_id = task.id, worker = agent.name(), "executing task");

    let call = time::timeout(
        settings.task_timeout,
        AssertUnwindSafe(agent.execute(task)).catch_unwind(),
    );
    tokio::pin!(call);

    let outcome = loop {
        tokio::select! {
            outcome = &mut call => break outcome,
            _ = heartbeat.tick() => beat(outbound),
        }
    };

    match outcome {
        Ok(Ok(Ok(output))) => TaskResult::success(task, output),
        Ok(Ok(Err(e))) => {
            warn!(task_id = task.id, error = %e, "task failed");
            TaskResult::failure(task, format!("{:#}", e))
        }
        Ok(Err(panic)) => {
            let detail = panic_message(panic.as_ref());
            warn!(task_id = task.id, %detail, "agent panicked");
            TaskResult::failure(task, format!("agent panicked: {}", detail))
        }
        Err(_) => {
            warn!(task_id = task.id, "task timed out");
            TaskResult::failure(
                task,
                format!("timed out after {}s", settings.task_timeout.as_secs_f64()),
            )
        }
    }
}

async fn abandon(pending: &mut BinaryHeap<Pending>, outbound: &mpsc::Sender<WorkerEvent>) {
    while let Some(Pending { task, .. }) = pending.pop() {
        let result = TaskResult::failure(&task, "worker stopped before the task started");
        if outbound.send(WorkerEvent::Completed(result)).await.is_err() {
            return;
        }
    }
}

fn beat(outbound: &mpsc::Sender<WorkerEvent>) {
    // Dropped when the channel is full; a backed-up channel already proves
    // the worker is alive.
    let _ = outbound.try_send(WorkerEvent::Heartbeat { at: Utc::now() });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
