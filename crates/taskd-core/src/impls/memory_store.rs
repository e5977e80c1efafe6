//! In-memory task store.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    ListFilter, NewTask, RecoveryReport, Task, TaskCounts, TaskId, TaskPage, TaskStatus,
    TaskUpdate,
};
use crate::ports::{Clock, DeleteOutcome, StoreError, SystemClock, TaskStore};

/// Task store kept in a `Vec` in insertion order.
///
/// Insertion order doubles as the tie-breaker for equal `created_at`, the
/// same role `rowid` plays in the SQLite store.
pub struct InMemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
    clock: Box<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            clock: Box::new(clock),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, id: TaskId, task: NewTask) -> Result<Task, StoreError> {
        let task = Task::new(id, task, self.clock.now());
        self.tasks.lock().await.push(task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.iter().find(|t| t.id == *id).cloned())
    }

    async fn list(&self, filter: ListFilter) -> Result<TaskPage, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<(usize, &Task)> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| filter.status.is_none_or(|s| t.status == s))
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .map(|(_, t)| t.clone())
            .collect();
        Ok(TaskPage { tasks: page, total })
    }

    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter_mut().find(|t| t.id == *id) else {
            return Ok(false);
        };
        update.apply(task);
        Ok(true)
    }

    async fn transition(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, StoreError> {
        let Some(next) = update.status else {
            return Ok(false);
        };
        let mut tasks = self.tasks.lock().await;
        match tasks.iter_mut().find(|t| t.id == *id) {
            Some(task) if task.status.can_transition_to(next) => {
                update.apply(task);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &TaskId) -> Result<DeleteOutcome, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let Some(pos) = tasks.iter().position(|t| t.id == *id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let status = tasks[pos].status;
        if status.is_active() {
            return Ok(DeleteOutcome::Active(status));
        }
        tasks.remove(pos);
        Ok(DeleteOutcome::Deleted)
    }

    async fn oldest_pending(&self) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.lock().await;
        // min_by_key keeps the first of equal keys, i.e. the earliest inserted
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| t.created_at)
            .cloned())
    }

    async fn reset_running_to_pending(&self) -> Result<RecoveryReport, StoreError> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.iter_mut() {
            match task.status {
                TaskStatus::Running => {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    report.requeued += 1;
                }
                TaskStatus::Cancelling => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(now);
                    report.cancelled += 1;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut counts = TaskCounts::default();
        for task in tasks.iter() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
