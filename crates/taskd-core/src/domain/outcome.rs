//! What a finished agent process looked like, and the task state it maps to.

use super::TaskStatus;

/// Why the supervisor asked a process to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A user cancelled the task.
    Cancel,
    /// The daemon is shutting down.
    Shutdown,
}

/// Everything captured from one agent process that ran to an exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; 1 when the process was killed by a signal.
    pub exit_code: i32,
    /// Terminating signal, when there was one.
    pub signal: Option<i32>,
    /// Set when a stop was requested while the process was alive.
    pub stop: Option<StopReason>,
}

impl ExitReport {
    /// Terminal status for this exit.
    ///
    /// A process that exits with a code after a cancel request keeps that
    /// result. Only death by signal after a cancel counts as `Cancelled`.
    pub fn status(&self) -> TaskStatus {
        if self.signal.is_some() && self.stop == Some(StopReason::Cancel) {
            TaskStatus::Cancelled
        } else if self.signal.is_none() && self.exit_code == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }

    /// Error text stored with the task, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match self.status() {
            TaskStatus::Completed => None,
            TaskStatus::Cancelled => Some("cancelled by request".to_string()),
            _ if !self.stderr.trim().is_empty() => Some(self.stderr.clone()),
            _ => Some(match self.signal {
                Some(sig) => format!("process terminated by signal {sig}"),
                None => format!("process exited with code {}", self.exit_code),
            }),
        }
    }
}
