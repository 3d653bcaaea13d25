//! Append-only record of every task that reached a worker and how it ended,
//! next to the lifetime counters of each worker.
//!
//! Records are written once and never touched again. The SQLite backend
//! owns ordering (`seq` is the rowid) and duplicate rejection (`task_id` is
//! unique), so a second process appending to the same file cannot reuse
//! either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agents::{ResultStatus, Specialization, Task, TaskId, TaskResult};
use crate::error::HistoryError;

/// Pass this as the history path to keep history in memory only.
pub const IN_MEMORY: &str = ":memory:";

/// What a caller hands to [`HistoryStore::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub task_id: TaskId,
    pub specialization: Specialization,
    pub command: String,
    pub payload: String,
    pub result: String,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_outcome(task: &Task, result: &TaskResult) -> Self {
        Self {
            task_id: task.id,
            specialization: task.specialization(),
            command: task.kind.command_line().to_string(),
            payload: task.payload.clone(),
            result: result.output.clone(),
            status: result.status,
            error: result.error.clone(),
            created_at: task.created_at,
            completed_at: result.completed_at,
        }
    }
}

/// A stored entry. `seq` is assigned by the store and strictly increases.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub seq: u64,
    pub entry: HistoryEntry,
    pub recorded_at: DateTime<Utc>,
}

/// Lifetime counters of one worker, carried across sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerState {
    pub specialization: Specialization,
    pub name: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_active: DateTime<Utc>,
    /// `idle`, `busy`, `crashed` or `stopped`.
    pub current_status: String,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError>;

    /// The most recent `limit` records, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError>;

    async fn len(&self) -> Result<usize, HistoryError>;

    async fn is_empty(&self) -> Result<bool, HistoryError> {
        Ok(self.len().await? == 0)
    }

    /// Largest task id ever recorded, used to seed the id sequence.
    async fn max_task_id(&self) -> Result<Option<TaskId>, HistoryError>;

    async fn worker_states(&self) -> Result<Vec<WorkerState>, HistoryError>;

    /// Inserts or replaces the row for `state.specialization`.
    async fn save_worker_state(&self, state: &WorkerState) -> Result<(), HistoryError>;
}

#[derive(Debug, Default)]
struct MemoryLedger {
    records: Vec<HistoryRecord>,
    workers: HashMap<Specialization, WorkerState>,
}

/// Keeps everything in process memory. Used for [`IN_MEMORY`] and tests.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    ledger: Mutex<MemoryLedger>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.records.iter().any(|r| r.entry.task_id == entry.task_id) {
            return Err(HistoryError::DuplicateTask(entry.task_id));
        }
        let record = HistoryRecord {
            seq: ledger.records.last().map_or(1, |r| r.seq + 1),
            entry,
            recorded_at: Utc::now(),
        };
        ledger.records.push(record.clone());
        Ok(record)
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.records.iter().rev().take(limit).cloned().collect())
    }

    async fn len(&self) -> Result<usize, HistoryError> {
        Ok(self.ledger.lock().await.records.len())
    }

    async fn max_task_id(&self) -> Result<Option<TaskId>, HistoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.records.iter().map(|r| r.entry.task_id).max())
    }

    async fn worker_states(&self) -> Result<Vec<WorkerState>, HistoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.workers.values().cloned().collect())
    }

    async fn save_worker_state(&self, state: &WorkerState) -> Result<(), HistoryError> {
        let mut ledger = self.ledger.lock().await;
        ledger.workers.insert(state.specialization, state.clone());
        Ok(())
    }
}

/// SQLite file backend.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteHistory {
    /// Opens or creates the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: Some(path),
        };
        store.run_migrations().await?;
        info!(path = ?store.path, "history opened");
        Ok(store)
    }

    /// A private SQLite database that lives as long as this store.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool, path: None };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL UNIQUE,
                specialization TEXT NOT NULL,
                command TEXT NOT NULL,
                payload TEXT NOT NULL,
                result TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_states (
                specialization TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                tasks_failed INTEGER NOT NULL DEFAULT 0,
                last_active TEXT NOT NULL,
                current_status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_history_specialization ON task_history(specialization)",
        )
        .execute(&self.pool)
        .await?;

        debug!("history migrations applied");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError> {
        let task_id = to_db_id(entry.task_id)?;
        let recorded_at = Utc::now();

        let done = sqlx::query(
            r#"
            INSERT INTO task_history (
                task_id, specialization, command, payload, result, status,
                error, created_at, completed_at, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(task_id)
        .bind(entry.specialization.as_str())
        .bind(&entry.command)
        .bind(&entry.payload)
        .bind(&entry.result)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.completed_at.to_rfc3339())
        .bind(recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, entry.task_id))?;

        let seq = u64::try_from(done.last_insert_rowid())
            .map_err(|_| HistoryError::Corrupt(format!("negative seq {}", done.last_insert_rowid())))?;
        debug!(seq, task_id = entry.task_id, "history record appended");

        Ok(HistoryRecord {
            seq,
            entry,
            recorded_at,
        })
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, task_id, specialization, command, payload, result, status,
                   error, created_at, completed_at, recorded_at
            FROM task_history
            ORDER BY seq DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match row_to_record(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable history row");
                    None
                }
            })
            .collect())
    }

    async fn len(&self) -> Result<usize, HistoryError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM task_history")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn max_task_id(&self) -> Result<Option<TaskId>, HistoryError> {
        let max: Option<i64> = sqlx::query("SELECT MAX(task_id) AS max_id FROM task_history")
            .fetch_one(&self.pool)
            .await?
            .try_get("max_id")?;
        max.map(from_db_id).transpose()
    }

    async fn worker_states(&self) -> Result<Vec<WorkerState>, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT specialization, agent_name, tasks_completed, tasks_failed,
                   last_active, current_status
            FROM agent_states
            ORDER BY specialization
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match row_to_worker_state(row) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable worker state");
                    None
                }
            })
            .collect())
    }

    async fn save_worker_state(&self, state: &WorkerState) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            INSERT INTO agent_states (
                specialization, agent_name, tasks_completed, tasks_failed,
                last_active, current_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(specialization) DO UPDATE SET
                agent_name = excluded.agent_name,
                tasks_completed = excluded.tasks_completed,
                tasks_failed = excluded.tasks_failed,
                last_active = excluded.last_active,
                current_status = excluded.current_status
            "#,
        )
        .bind(state.specialization.as_str())
        .bind(&state.name)
        .bind(i64::try_from(state.tasks_completed).unwrap_or(i64::MAX))
        .bind(i64::try_from(state.tasks_failed).unwrap_or(i64::MAX))
        .bind(state.last_active.to_rfc3339())
        .bind(&state.current_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn insert_error(e: sqlx::Error, task_id: TaskId) -> HistoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => HistoryError::DuplicateTask(task_id),
        _ => HistoryError::Database(e),
    }
}

fn to_db_id(id: TaskId) -> Result<i64, HistoryError> {
    i64::try_from(id).map_err(|_| HistoryError::TaskIdOutOfRange(id))
}

fn from_db_id(id: i64) -> Result<TaskId, HistoryError> {
    TaskId::try_from(id).map_err(|_| HistoryError::Corrupt(format!("negative task id {}", id)))
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::Corrupt(format!("invalid timestamp '{}': {}", value, e)))
}

fn row_to_record(row: &SqliteRow) -> Result<HistoryRecord, HistoryError> {
    let seq: i64 = row.try_get("seq")?;
    let specialization: String = row.try_get("specialization")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let completed_at: String = row.try_get("completed_at")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    Ok(HistoryRecord {
        seq: u64::try_from(seq).map_err(|_| HistoryError::Corrupt(format!("negative seq {}", seq)))?,
        entry: HistoryEntry {
            task_id: from_db_id(row.try_get("task_id")?)?,
            specialization: specialization.parse().map_err(HistoryError::Corrupt)?,
            command: row.try_get("command")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            status: status.parse().map_err(HistoryError::Corrupt)?,
            error: row.try_get("error")?,
            created_at: parse_time(&created_at)?,
            completed_at: parse_time(&completed_at)?,
        },
        recorded_at: parse_time(&recorded_at)?,
    })
}

fn row_to_worker_state(row: &SqliteRow) -> Result<WorkerState, HistoryError> {
    let specialization: String = row.try_get("specialization")?;
    let last_active: String = row.try_get("last_active")?;

    Ok(WorkerState {
        specialization: specialization.parse().map_err(HistoryError::Corrupt)?,
        name: row.try_get("agent_name")?,
        tasks_completed: count(row.try_get("tasks_completed")?),
        tasks_failed: count(row.try_get("tasks_failed")?),
        last_active: parse_time(&last_active)?,
        current_status: row.try_get("current_status")?,
    })
}

/// Opens the configured backend; [`IN_MEMORY`] selects [`MemoryHistory`].
pub async fn open_store(path: &Path) -> Result<Box<dyn HistoryStore>, HistoryError> {
    if path.as_os_str() == IN_MEMORY {
        Ok(Box::new(MemoryHistory::new()))
    } else {
        Ok(Box::new(SqliteHistory::open(path).await?))
    }
}
