//! TaskService - validated submission and query operations.
//!
//! Everything the HTTP layer exposes goes through here. The service only
//! talks to the store and, for cancellation, to the runner's supervisor; it
//! never waits on a running task.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::status::DaemonStatus;
use crate::domain::{ListFilter, NewTask, Task, TaskId, TaskPage, TaskStatus, TaskUpdate};
use crate::error::TaskdError;
use crate::ports::{Clock, DeleteOutcome, IdGenerator, TaskStore};
use crate::queue::QueueRunner;

pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

/// Body of a submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub project_dir: Option<String>,
}

impl Submission {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            project_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    fn validate(self) -> Result<NewTask, TaskdError> {
        let prompt = self.prompt.unwrap_or_default();
        if prompt.trim().is_empty() {
            return Err(TaskdError::Validation("prompt is required".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(TaskdError::Validation(
                "prompt must be under 10,000 characters".into(),
            ));
        }
        let project_dir = self.project_dir.filter(|d| !d.is_empty());
        if let Some(dir) = &project_dir
            && !Path::new(dir).is_absolute()
        {
            return Err(TaskdError::Validation(
                "project_dir must be an absolute path".into(),
            ));
        }
        Ok(NewTask {
            prompt: prompt.trim().to_string(),
            project_dir,
        })
    }
}

/// Listing parameters as they arrive; missing values take defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListQuery {
    fn into_filter(self) -> ListFilter {
        let limit = match self.limit {
            None | Some(0) => DEFAULT_LIST_LIMIT,
            Some(n) => n.min(MAX_LIST_LIMIT),
        };
        ListFilter {
            status: self.status,
            limit,
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub id: TaskId,
    pub status: TaskStatus,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    runner: Arc<QueueRunner>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    started: Instant,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<QueueRunner>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            runner,
            ids,
            clock,
            started: Instant::now(),
        }
    }

    pub async fn submit(&self, submission: Submission) -> Result<Task, TaskdError> {
        let new = submission.validate()?;
        let task = self.store.create(self.ids.generate_task_id(), new).await?;
        info!(task_id = %task.id, "task submitted");
        self.runner.wake();
        Ok(task)
    }

    pub async fn list(&self, query: ListQuery) -> Result<TaskPage, TaskdError> {
        Ok(self.store.list(query.into_filter()).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Task, TaskdError> {
        let id = parse_id(id)?;
        self.store
            .get(&id)
            .await?
            .ok_or_else(|| TaskdError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<(), TaskdError> {
        let id = parse_id(id)?;
        match self.store.delete(&id).await? {
            DeleteOutcome::Deleted => {
                info!(task_id = %id, "task deleted");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(TaskdError::NotFound(id.to_string())),
            DeleteOutcome::Active(status) => Err(TaskdError::Conflict(format!(
                "Cannot delete a {status} task"
            ))),
        }
    }

    /// Cancel a pending task outright, or ask the runner to stop a running one.
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome, TaskdError> {
        let id = parse_id(id)?;
        // a pending task can be claimed between the read and the write; one retry
        // sees it as running
        for _ in 0..2 {
            let task = self
                .store
                .get(&id)
                .await?
                .ok_or_else(|| TaskdError::NotFound(id.to_string()))?;

            match task.status {
                TaskStatus::Pending => {
                    if self
                        .store
                        .transition(&id, TaskUpdate::cancelled(self.clock.now()))
                        .await?
                    {
                        info!(task_id = %id, "pending task cancelled");
                        return Ok(CancelOutcome {
                            id,
                            status: TaskStatus::Cancelled,
                        });
                    }
                }
                TaskStatus::Running => {
                    if self.store.transition(&id, TaskUpdate::cancelling()).await? {
                        if !self.runner.supervisor().cancel(&id) {
                            debug!(task_id = %id, "no live process yet, runner will settle the task");
                        }
                        return Ok(CancelOutcome {
                            id,
                            status: TaskStatus::Cancelling,
                        });
                    }
                }
                status => {
                    return Err(TaskdError::Conflict(format!(
                        "Cannot cancel task with status: {status}"
                    )));
                }
            }
        }
        let status = self
            .store
            .get(&id)
            .await?
            .map(|t| t.status.to_string())
            .unwrap_or_else(|| "deleted".into());
        Err(TaskdError::Conflict(format!(
            "Cannot cancel task with status: {status}"
        )))
    }

    pub async fn status(&self) -> Result<DaemonStatus, TaskdError> {
        let counts = self.store.counts().await?;
        Ok(DaemonStatus::new(
            self.started.elapsed(),
            self.runner.supervisor().active_task(),
            counts,
        ))
    }
}

fn parse_id(raw: &str) -> Result<TaskId, TaskdError> {
    raw.parse().map_err(|_| TaskdError::NotFound(raw.to_string()))
}
