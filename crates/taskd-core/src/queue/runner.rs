//! Queue runner - the single worker that drains pending tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::domain::{ExitReport, Notice, RunRecord, Task, TaskId, TaskStatus, TaskUpdate};
use crate::parser::parse_output;
use crate::ports::{Clock, Notifier, StoreError, TaskStore};
use crate::supervisor::{ProcessSupervisor, RunFailure, RunRequest};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A task was already in flight.
    Busy,
    /// Nothing pending.
    Idle,
    /// The claim lost a race (the task was cancelled or taken meanwhile).
    Skipped(TaskId),
    /// The task reached a terminal state.
    Finished { task_id: TaskId, status: TaskStatus },
    /// Shutdown stopped the run; the task stays `running` for startup recovery.
    Interrupted(TaskId),
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct QueueRunner {
    store: Arc<dyn TaskStore>,
    supervisor: Arc<ProcessSupervisor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    in_flight: AtomicBool,
    wake: Notify,
}

impl QueueRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        supervisor: Arc<ProcessSupervisor>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            notifier,
            clock,
            config,
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Is a task being executed right now?
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Nudge the loop to tick before the next poll.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Startup crash recovery. Call before `run`.
    pub async fn recover(&self) -> Result<(), StoreError> {
        let report = self.store.reset_running_to_pending().await?;
        if report.requeued > 0 || report.cancelled > 0 {
            warn!(
                requeued = report.requeued,
                cancelled = report.cancelled,
                "recovered tasks left over from a previous run"
            );
        }
        Ok(())
    }

    /// Dispatch at most one task and drive it to a terminal state.
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickOutcome::Busy);
        }
        let _in_flight = InFlight(&self.in_flight);

        let Some(task) = self.store.oldest_pending().await? else {
            return Ok(TickOutcome::Idle);
        };
        if !self
            .store
            .transition(&task.id, TaskUpdate::claim(self.clock.now()))
            .await?
        {
            debug!(task_id = %task.id, "claim lost, task left pending state");
            return Ok(TickOutcome::Skipped(task.id));
        }

        info!(task_id = %task.id, prompt = %preview(&task.prompt, 80), "starting task");
        let result = self.supervisor.run(self.request_for(&task)).await;
        self.finish(&task, result).await
    }

    fn request_for(&self, task: &Task) -> RunRequest {
        let working_dir = task
            .project_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_project_dir.clone());
        RunRequest {
            task_id: task.id,
            prompt: task.prompt.clone(),
            working_dir,
        }
    }

    async fn finish(
        &self,
        task: &Task,
        result: Result<ExitReport, RunFailure>,
    ) -> Result<TickOutcome, StoreError> {
        let (status, record) = match result {
            Ok(report) => {
                let status = report.status();
                let parsed = parse_output(&report.stdout);
                let record = RunRecord {
                    output: Some(parsed.text),
                    error: report.error_message(),
                    exit_code: Some(report.exit_code),
                    session_id: parsed.session_id,
                    tokens_used: parsed.tokens_used,
                    cost_usd: parsed.cost_usd,
                };
                (status, record)
            }
            Err(RunFailure::Interrupted { forced }) => {
                info!(task_id = %task.id, forced, "task interrupted by shutdown");
                return Ok(TickOutcome::Interrupted(task.id));
            }
            Err(RunFailure::ShuttingDown) => {
                info!(task_id = %task.id, "supervisor closed before the task started");
                return Ok(TickOutcome::Interrupted(task.id));
            }
            Err(failure) => {
                error!(task_id = %task.id, error = %failure, "task could not run to completion");
                let record = RunRecord {
                    error: Some(failure.to_string()),
                    ..RunRecord::default()
                };
                (TaskStatus::Failed, record)
            }
        };

        let now = self.clock.now();
        let mut final_status = status;
        if !self
            .store
            .transition(&task.id, TaskUpdate::finish(status, record.clone(), now))
            .await?
        {
            // cancelled by signal but the cancelling mark never landed
            final_status = TaskStatus::Failed;
            let fallback = TaskUpdate::finish(TaskStatus::Failed, record, now);
            if !self.store.transition(&task.id, fallback).await? {
                warn!(task_id = %task.id, intended = %status, "task vanished before its result was recorded");
                return Ok(TickOutcome::Skipped(task.id));
            }
        }

        info!(task_id = %task.id, status = %final_status, "task finished");
        self.notify(&task.id).await?;
        Ok(TickOutcome::Finished {
            task_id: task.id,
            status: final_status,
        })
    }

    /// Send the terminal notice for a task, once.
    ///
    /// Returns whether a notice went out. Notifier failures are logged and
    /// swallowed; the `notified` flag stays false in that case.
    pub async fn notify(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        if !self.notifier.is_enabled() {
            return Ok(false);
        }
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(false);
        };
        if task.notified || !task.status.is_terminal() {
            return Ok(false);
        }

        match self.notifier.send(&Notice::for_task(&task)).await {
            Ok(()) => {
                self.store.update(task_id, TaskUpdate::notified()).await?;
                info!(task_id = %task_id, "notification sent");
                Ok(true)
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "notification failed");
                Ok(false)
            }
        }
    }

    /// Poll loop. Returns once `shutdown` flips to true (or its sender is
    /// dropped) and any in-flight task has been stopped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(poll_ms = self.config.poll_interval.as_millis() as u64, "queue runner started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            let mut stopping = false;
            let outcome = loop {
                tokio::select! {
                    outcome = &mut tick => break outcome,
                    changed = shutdown.changed(), if !stopping => {
                        if changed.is_err() || *shutdown.borrow() {
                            stopping = true;
                            self.supervisor.shutdown();
                        }
                    }
                }
            };

            match outcome {
                // finished work may have left more behind it; go again without waiting
                Ok(TickOutcome::Finished { .. }) | Ok(TickOutcome::Skipped(_)) => self.wake(),
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "task store failed, stopping queue runner");
                    self.supervisor.shutdown();
                    return Err(err);
                }
            }
            if stopping {
                break;
            }
        }

        self.supervisor.shutdown();
        info!("queue runner stopped");
        Ok(())
    }
}

fn preview(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
