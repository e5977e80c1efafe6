//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Running -> Completed | Failed
/// - Pending -> Cancelled
/// - Running -> Cancelling -> Cancelled | Completed | Failed
///
/// Startup recovery moves Running back to Pending. That reset is not a
/// transition of this machine and has its own store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for the runner.
    Pending,

    /// The agent subprocess is executing.
    Running,

    /// A cancel was requested while running; the runner resolves the final state.
    Cancelling,

    /// Exited with code 0.
    Completed,

    /// Non-zero exit, spawn failure or timeout.
    Failed,

    /// Cancelled before it ran, or killed by a cancel request.
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Cancelling,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Does a live subprocess belong to a task in this state?
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Cancelling)
    }

    /// States from which a task may move into `self`.
    pub fn predecessors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Running => &[TaskStatus::Pending],
            TaskStatus::Cancelling => &[TaskStatus::Running],
            TaskStatus::Completed | TaskStatus::Failed => {
                &[TaskStatus::Running, TaskStatus::Cancelling]
            }
            TaskStatus::Cancelled => &[TaskStatus::Pending, TaskStatus::Cancelling],
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.predecessors().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
