use thiserror::Error;

use crate::agents::{Specialization, TaskId};

/// Failures surfaced by [`crate::agents::orchestrator::Orchestrator::dispatch`].
/// None of them are retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("no worker registered for {0} tasks")]
    UnknownSpecialization(Specialization),

    #[error("{specialization} queue is full ({capacity} tasks pending), try again later")]
    QueueSaturated {
        specialization: Specialization,
        capacity: usize,
    },

    #[error("{0} worker is not running")]
    WorkerUnavailable(Specialization),

    #[error("task {0} was already dispatched")]
    DuplicateTask(TaskId),

    #[error("no task ids left to hand out")]
    TaskIdsExhausted,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task {0} is already recorded")]
    DuplicateTask(TaskId),

    #[error("task id {0} is too large to record")]
    TaskIdOutOfRange(TaskId),

    #[error("unreadable history row: {0}")]
    Corrupt(String),
}
