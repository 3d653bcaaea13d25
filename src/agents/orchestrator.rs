use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::{spawn_worker, WorkerEvent, WorkerHandle, WorkerMessage, WorkerSettings};
use super::{Agent, Specialization, Task, TaskId, TaskResult, TaskStatus};
use crate::error::{HistoryError, OrchestratorError};
use crate::history::{HistoryEntry, HistoryRecord, HistoryStore, WorkerState};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// A worker silent for longer than this is reported as down.
    pub heartbeat_timeout: Duration,
    /// How long shutdown waits for each worker before aborting it.
    pub shutdown_grace: Duration,
    /// How many settled task statuses [`Orchestrator::task_status`] remembers.
    pub status_retention: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            status_retention: 1024,
        }
    }
}

/// Point-in-time view of one worker, as returned by [`Orchestrator::status`].
/// `completed` and `failed` are lifetime totals, including earlier sessions
/// that shared the same history.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub specialization: Specialization,
    pub name: String,
    pub worker_id: Uuid,
    pub alive: bool,
    pub last_seen: DateTime<Utc>,
    pub last_seen_age: Duration,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

/// A finished task waiting to be recorded. The task is missing only when a
/// worker reports an id the orchestrator never dispatched to it.
type Settled = (Option<Task>, TaskResult);

struct WorkerSlot {
    handle: WorkerHandle,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    in_flight: HashMap<TaskId, Task>,
    completed: u64,
    failed: u64,
    crashed: bool,
}

impl WorkerSlot {
    fn new(handle: WorkerHandle, saved: Option<WorkerState>) -> Self {
        let now = Utc::now();
        let (completed, failed, last_active) = saved
            .map(|s| (s.tasks_completed, s.tasks_failed, s.last_active))
            .unwrap_or((0, 0, now));
        Self {
            handle,
            last_seen: Instant::now(),
            last_seen_at: now,
            last_active,
            in_flight: HashMap::new(),
            completed,
            failed,
            crashed: false,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }

    fn absorb(&mut self, event: WorkerEvent) -> Option<Settled> {
        self.touch();
        match event {
            WorkerEvent::Heartbeat { .. } => None,
            WorkerEvent::Started { task_id, .. } => {
                if let Some(task) = self.in_flight.get_mut(&task_id) {
                    task.status = TaskStatus::InProgress;
                }
                None
            }
            WorkerEvent::Completed(result) => {
                if result.is_success() {
                    self.completed += 1;
                } else {
                    self.failed += 1;
                }
                self.last_active = result.completed_at;
                let task = self.in_flight.remove(&result.task_id);
                if task.is_none() {
                    warn!(
                        task_id = result.task_id,
                        worker = %self.handle.name,
                        "result for a task this worker was never given"
                    );
                }
                Some((task, result))
            }
        }
    }

    /// Fails everything still assigned to this worker.
    fn fail_in_flight(&mut self, reason: &str) -> Vec<Settled> {
        let mut ids: Vec<TaskId> = self.in_flight.keys().copied().collect();
        ids.sort_unstable();
        let settled: Vec<Settled> = ids
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id))
            .map(|task| {
                self.failed += 1;
                let result = TaskResult::failure(&task, reason);
                (Some(task), result)
            })
            .collect();
        if !settled.is_empty() {
            self.last_active = Utc::now();
        }
        settled
    }

    fn state(&self, stopped: bool) -> WorkerState {
        let current_status = if self.crashed {
            "crashed"
        } else if stopped {
            "stopped"
        } else if self.in_flight.is_empty() {
            "idle"
        } else {
            "busy"
        };
        WorkerState {
            specialization: self.handle.specialization,
            name: self.handle.name.clone(),
            tasks_completed: self.completed,
            tasks_failed: self.failed,
            last_active: self.last_active,
            current_status: current_status.to_string(),
        }
    }
}

/// Routes tasks to one worker per specialization and gathers their results.
///
/// `dispatch` and `status` never wait. `collect` only waits on the history
/// store while recording what arrived; [`Orchestrator::shutdown`] is the one
/// place that waits on workers.
pub struct Orchestrator {
    workers: HashMap<Specialization, WorkerSlot>,
    history: Box<dyn HistoryStore>,
    settings: OrchestratorSettings,
    settled: HashMap<TaskId, TaskStatus>,
    settled_order: VecDeque<TaskId>,
    unrecorded: Vec<Settled>,
    dirty: HashSet<Specialization>,
    ready: Vec<TaskResult>,
    last_dispatched: Option<TaskId>,
}

impl Orchestrator {
    /// Takes over running workers. Their counters continue from whatever the
    /// history store saved for the same specialization.
    pub async fn new(
        workers: HashMap<Specialization, WorkerHandle>,
        history: Box<dyn HistoryStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let mut saved: HashMap<Specialization, WorkerState> = match history.worker_states().await {
            Ok(states) => states.into_iter().map(|s| (s.specialization, s)).collect(),
            Err(e) => {
                warn!(error = %e, "could not load worker counters, starting from zero");
                HashMap::new()
            }
        };

        let workers = workers
            .into_iter()
            .map(|(specialization, handle)| {
                let slot = WorkerSlot::new(handle, saved.remove(&specialization));
                (specialization, slot)
            })
            .collect();

        Self {
            workers,
            history,
            settings,
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
            unrecorded: Vec::new(),
            dirty: HashSet::new(),
            ready: Vec::new(),
            last_dispatched: None,
        }
    }

    /// Spawns one worker per agent. A later agent with the same
    /// specialization replaces an earlier one.
    pub async fn spawn(
        agents: Vec<Arc<dyn Agent>>,
        worker_settings: WorkerSettings,
        history: Box<dyn HistoryStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let mut workers = HashMap::new();
        for agent in agents {
            let specialization = agent.specialization();
            let handle = spawn_worker(agent, worker_settings.clone());
            if let Some(previous) = workers.insert(specialization, handle) {
                warn!(%specialization, worker = %previous.name, "replacing worker with the same specialization");
                previous.join.abort();
            }
        }
        Self::new(workers, history, settings).await
    }

    pub fn specializations(&self) -> Vec<Specialization> {
        let mut specs: Vec<_> = self.workers.keys().copied().collect();
        specs.sort_by_key(|s| s.as_str());
        specs
    }

    pub fn dispatch(&mut self, mut task: Task) -> Result<(), OrchestratorError> {
        if self.last_dispatched.is_some_and(|last| task.id <= last) {
            return Err(OrchestratorError::DuplicateTask(task.id));
        }

        let specialization = task.specialization();
        let slot = self
            .workers
            .get_mut(&specialization)
            .ok_or(OrchestratorError::UnknownSpecialization(specialization))?;

        if slot.crashed {
            return Err(OrchestratorError::WorkerUnavailable(specialization));
        }

        task.status = TaskStatus::Queued;
        match slot.handle.inbound.try_send(WorkerMessage::Task(task.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(task_id = task.id, %specialization, "inbound queue full");
                return Err(OrchestratorError::QueueSaturated {
                    specialization,
                    capacity: slot.handle.capacity,
                });
            }
            Err(TrySendError::Closed(_)) => {
                return Err(OrchestratorError::WorkerUnavailable(specialization));
            }
        }

        debug!(task_id = task.id, %specialization, priority = %task.priority, "task dispatched");
        self.last_dispatched = Some(task.id);
        slot.in_flight.insert(task.id, task);
        Ok(())
    }

    /// Every result that has arrived since the last call, each one already
    /// recorded in the history. Never waits on a worker.
    pub async fn collect(&mut self) -> Vec<TaskResult> {
        self.pump();
        self.record(false).await;
        std::mem::take(&mut self.ready)
    }

    pub fn status(&mut self) -> Vec<WorkerStatus> {
        self.pump();

        let timeout = self.settings.heartbeat_timeout;
        self.specializations()
            .into_iter()
            .filter_map(|specialization| self.workers.get(&specialization))
            .map(|slot| {
                let age = slot.last_seen.elapsed();
                WorkerStatus {
                    specialization: slot.handle.specialization,
                    name: slot.handle.name.clone(),
                    worker_id: slot.handle.id,
                    alive: !slot.crashed && age <= timeout,
                    last_seen: slot.last_seen_at,
                    last_seen_age: age,
                    in_flight: slot.in_flight.len(),
                    completed: slot.completed,
                    failed: slot.failed,
                }
            })
            .collect()
    }

    /// `None` for ids never dispatched and for settled ids older than the
    /// retention window.
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.workers
            .values()
            .find_map(|slot| slot.in_flight.get(&id).map(|task| task.status))
            .or_else(|| self.settled.get(&id).copied())
    }

    /// Number of dispatched tasks whose results have not been collected yet.
    pub fn outstanding(&self) -> usize {
        self.workers.values().map(|s| s.in_flight.len()).sum::<usize>()
            + self.unrecorded.len()
            + self.ready.len()
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.history.list(limit).await
    }

    pub async fn last_recorded_task_id(&self) -> Result<Option<TaskId>, HistoryError> {
        self.history.max_task_id().await
    }

    /// Stops every worker, waiting up to the grace period for each, and
    /// returns the results that had not been collected yet. Tasks that never
    /// finished are returned as failed.
    pub async fn shutdown(mut self) -> Vec<TaskResult> {
        self.pump();
        let grace = self.settings.shutdown_grace;

        for specialization in self.specializations() {
            let Some(slot) = self.workers.get_mut(&specialization) else {
                continue;
            };
            let mut settled = Vec::new();

            if !slot.crashed {
                let deadline = time::Instant::now() + grace;
                let stop_sent =
                    time::timeout_at(deadline, slot.handle.inbound.send(WorkerMessage::Stop)).await;
                if !matches!(stop_sent, Ok(Ok(()))) {
                    debug!(%specialization, "could not deliver stop message");
                }

                // The outbound channel closes once the worker has exited.
                let exited = loop {
                    tokio::select! {
                        event = slot.handle.outbound.recv() => match event {
                            Some(event) => settled.extend(slot.absorb(event)),
                            None => break true,
                        },
                        _ = time::sleep_until(deadline) => break false,
                    }
                };

                if exited {
                    info!(%specialization, worker = %slot.handle.name, "worker stopped");
                } else {
                    warn!(%specialization, worker = %slot.handle.name, grace_secs = grace.as_secs_f64(), "worker did not stop in time, aborting");
                    slot.handle.join.abort();
                }
                let _ = (&mut slot.handle.join).await;
            }

            settled.extend(slot.fail_in_flight("orchestrator shut down before the task finished"));
            self.dirty.insert(specialization);
            for (task, result) in settled {
                self.settle(task, result);
            }
        }

        self.record(true).await;
        std::mem::take(&mut self.ready)
    }

    /// Drains every outbound channel without waiting and notices workers
    /// whose task has ended on its own.
    fn pump(&mut self) {
        let mut settled = Vec::new();

        for (specialization, slot) in self.workers.iter_mut() {
            if slot.crashed {
                continue;
            }
            // Checked before draining so nothing a dead worker sent is missed.
            let finished = slot.handle.is_finished();
            let before = settled.len();

            loop {
                match slot.handle.outbound.try_recv() {
                    Ok(event) => settled.extend(slot.absorb(event)),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if finished {
                error!(%specialization, worker = %slot.handle.name, in_flight = slot.in_flight.len(), "worker terminated unexpectedly");
                slot.crashed = true;
                let reason = format!("{} worker terminated unexpectedly", specialization);
                settled.extend(slot.fail_in_flight(&reason));
            }

            if finished || settled.len() > before {
                self.dirty.insert(*specialization);
            }
        }

        for (task, result) in settled {
            self.settle(task, result);
        }
    }

    fn settle(&mut self, task: Option<Task>, result: TaskResult) {
        let status = if result.is_success() {
            TaskStatus::Done
        } else {
            TaskStatus::Failed
        };
        self.remember(result.task_id, status);
        self.unrecorded.push((task, result));
    }

    fn remember(&mut self, id: TaskId, status: TaskStatus) {
        if self.settled.insert(id, status).is_none() {
            self.settled_order.push_back(id);
        }
        while self.settled_order.len() > self.settings.status_retention {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    /// Writes settled tasks and changed worker counters to the history, then
    /// releases the results to `ready`. A store failure is logged and the
    /// result is still handed out.
    async fn record(&mut self, stopped: bool) {
        for (task, result) in std::mem::take(&mut self.unrecorded) {
            if let Some(task) = task {
                let entry = HistoryEntry::from_outcome(&task, &result);
                if let Err(e) = self.history.append(entry).await {
                    error!(task_id = result.task_id, error = %e, "failed to record task in history");
                }
            }
            self.ready.push(result);
        }

        let dirty: Vec<Specialization> = if stopped {
            self.dirty.clear();
            self.specializations()
        } else {
            self.dirty.drain().collect()
        };
        for specialization in dirty {
            let Some(slot) = self.workers.get(&specialization) else {
                continue;
            };
            let state = slot.state(stopped);
            if let Err(e) = self.history.save_worker_state(&state).await {
                warn!(%specialization, error = %e, "failed to save worker counters");
            }
        }
    }
}
