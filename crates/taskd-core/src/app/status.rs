//! Status - daemon health snapshot served at `/api/status`.

use std::time::Duration;

use serde::Serialize;

use crate::domain::{TaskCounts, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub status: &'static str,
    pub uptime_seconds: u64,
    /// Task whose agent process is alive, if any.
    pub current_task: Option<TaskId>,
    pub queue_depth: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

impl DaemonStatus {
    pub fn new(uptime: Duration, current_task: Option<TaskId>, counts: TaskCounts) -> Self {
        Self {
            status: "ok",
            uptime_seconds: uptime.as_secs(),
            current_task,
            queue_depth: counts.pending,
            tasks_completed: counts.completed,
            tasks_failed: counts.failed,
            tasks_cancelled: counts.cancelled,
        }
    }
}
