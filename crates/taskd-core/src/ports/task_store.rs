//! TaskStore port - the durable record of every task.
//!
//! # Implementations
//! - `SqliteTaskStore`: the daemon's store
//! - `InMemoryTaskStore`: tests

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    ListFilter, NewTask, RecoveryReport, Task, TaskCounts, TaskId, TaskPage, TaskStatus,
    TaskUpdate,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage worker failed: {0}")]
    Join(String),

    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    /// A row could not be decoded into a task.
    #[error("corrupt task {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result of [`TaskStore::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The task owns a live process and was left alone.
    Active(TaskStatus),
}

/// Durable task records.
///
/// # Design
/// - Status changes go through [`TaskStore::transition`], which applies the
///   patch only when the current status is a legal predecessor of the new
///   one. That conditional write is what makes claiming and cancelling safe
///   against each other.
/// - `list` is newest first; `oldest_pending` is oldest first. Equal
///   `created_at` values fall back to insertion order in both.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending task.
    async fn create(&self, id: TaskId, task: NewTask) -> Result<Task, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    async fn list(&self, filter: ListFilter) -> Result<TaskPage, StoreError>;

    /// Apply `update` unconditionally. Returns false when the task is missing.
    ///
    /// Callers use this for fields outside the status machine (`notified`).
    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError>;

    /// Apply `update` only if its status is reachable from the current one.
    ///
    /// `update.status` must be set. Returns false when the task is missing or
    /// the transition is not allowed; nothing is written in that case.
    async fn transition(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError>;

    /// Remove a pending or terminal task.
    async fn delete(&self, id: &TaskId) -> Result<DeleteOutcome, StoreError>;

    /// The next task to run.
    async fn oldest_pending(&self) -> Result<Option<Task>, StoreError>;

    /// Startup recovery.
    ///
    /// Every `running` task goes back to `pending` with `started_at` cleared.
    /// Tasks stuck in `cancelling` are finished as `cancelled`.
    async fn reset_running_to_pending(&self) -> Result<RecoveryReport, StoreError>;

    async fn counts(&self) -> Result<TaskCounts, StoreError>;
}
