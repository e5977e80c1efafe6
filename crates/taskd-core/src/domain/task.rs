//! Task record and the field patches applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus};

/// A queued unit of agent work.
///
/// Design:
/// - `prompt`, `project_dir` and `created_at` never change after insertion.
/// - Result fields stay `None` until the runner records a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub prompt: String,
    /// Working directory for the agent; the configured default is used when absent.
    pub project_dir: Option<String>,
    pub status: TaskStatus,

    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub cost_usd: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set once a notification for the terminal state went out.
    pub notified: bool,
}

impl Task {
    /// Build the record for a freshly submitted task.
    pub fn new(id: TaskId, new: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            prompt: new.prompt,
            project_dir: new.project_dir,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            exit_code: None,
            session_id: None,
            tokens_used: None,
            cost_usd: None,
            created_at,
            started_at: None,
            completed_at: None,
            notified: false,
        }
    }

    /// Wall-clock run time, when both ends are known.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// Already-validated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub prompt: String,
    pub project_dir: Option<String>,
}

/// Result fields persisted when a run ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub cost_usd: Option<f64>,
}

/// Partial update of a task.
///
/// `None` leaves a field untouched. For nullable columns the inner `Option`
/// is the value written, so `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub output: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub exit_code: Option<Option<i32>>,
    pub session_id: Option<Option<String>>,
    pub tokens_used: Option<Option<i64>>,
    pub cost_usd: Option<Option<f64>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub notified: Option<bool>,
}

impl TaskUpdate {
    /// pending -> running.
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            started_at: Some(Some(now)),
            ..Self::default()
        }
    }

    /// running -> cancelling.
    pub fn cancelling() -> Self {
        Self {
            status: Some(TaskStatus::Cancelling),
            ..Self::default()
        }
    }

    /// Any terminal state together with the run's results.
    pub fn finish(status: TaskStatus, record: RunRecord, now: DateTime<Utc>) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status: Some(status),
            output: Some(record.output),
            error: Some(record.error),
            exit_code: Some(record.exit_code),
            session_id: Some(record.session_id),
            tokens_used: Some(record.tokens_used),
            cost_usd: Some(record.cost_usd),
            completed_at: Some(Some(now)),
            ..Self::default()
        }
    }

    /// Cancellation of a task that never ran.
    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Cancelled),
            completed_at: Some(Some(now)),
            ..Self::default()
        }
    }

    pub fn notified() -> Self {
        Self {
            notified: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write every set field into `task`.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(output) = &self.output {
            task.output = output.clone();
        }
        if let Some(error) = &self.error {
            task.error = error.clone();
        }
        if let Some(exit_code) = self.exit_code {
            task.exit_code = exit_code;
        }
        if let Some(session_id) = &self.session_id {
            task.session_id = session_id.clone();
        }
        if let Some(tokens_used) = self.tokens_used {
            task.tokens_used = tokens_used;
        }
        if let Some(cost_usd) = self.cost_usd {
            task.cost_usd = cost_usd;
        }
        if let Some(started_at) = self.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(notified) = self.notified {
            task.notified = notified;
        }
    }
}

/// Filter and window for listing tasks, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of a listing plus the total number of matching tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub cancelling: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Cancelling => self.cancelling += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }
}

/// What `reset_running_to_pending` did at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running tasks moved back to pending.
    pub requeued: usize,
    /// Cancelling tasks whose process died with the previous daemon.
    pub cancelled: usize,
}
