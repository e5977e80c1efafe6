//! Process supervisor - runs one agent subprocess at a time.
//!
//! # Lifecycle
//! Each invocation walks an explicit phase machine:
//!
//! ```text
//! Spawned -> Running -> Exited
//!                    -> TimedOut        -> Exited | Killed
//!                    -> Stopping(why)   -> Exited | Killed
//! ```
//!
//! The deadline, the stop request, and natural exit race in one `select!`.
//! Whichever wins is the only trigger: the losing futures are dropped, so the
//! deadline fires at most once and a process gets at most one SIGTERM ->
//! grace -> SIGKILL escalation.
//!
//! The child is started in its own process group and signals go to the
//! group, so helpers the agent spawned die with it.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::domain::{ExitReport, StopReason, TaskId};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub task_id: TaskId,
    pub prompt: String,
    pub working_dir: PathBuf,
}

/// A run that produced no usable exit.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Output is discarded. `forced` means SIGTERM was ignored.
    #[error("Task timed out after {}", human_duration(.after))]
    TimedOut { after: Duration, forced: bool },

    /// Killed because the daemon is stopping; the task should be retried.
    #[error("interrupted by shutdown")]
    Interrupted { forced: bool },

    /// A second run was attempted while one is in flight.
    #[error("task {active} is already running")]
    Busy { active: TaskId },

    #[error("supervisor is shut down")]
    ShuttingDown,

    #[error("lost track of agent process: {0}")]
    Io(#[from] io::Error),
}

fn human_duration(d: &Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{d:?}")
    }
}

/// Where one invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Spawned,
    Running,
    TimedOut,
    Stopping(StopReason),
    Exited,
    Killed,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        use self::Phase::*;
        matches!(
            (self, next),
            (Spawned, Running)
                | (Running, TimedOut | Stopping(_) | Exited)
                | (TimedOut | Stopping(_), Exited | Killed)
        )
    }
}

struct Lifecycle {
    task_id: TaskId,
    phase: Phase,
}

impl Lifecycle {
    fn spawned(task_id: TaskId) -> Self {
        debug!(task_id = %task_id, phase = ?Phase::Spawned, "agent phase");
        Self {
            task_id,
            phase: Phase::Spawned,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase change {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(task_id = %self.task_id, from = ?self.phase, to = ?next, "agent phase");
        self.phase = next;
    }
}

/// The current-run slot.
struct ActiveRun {
    task_id: TaskId,
    stop_tx: watch::Sender<Option<StopReason>>,
}

impl ActiveRun {
    /// Record the first stop request; later ones are ignored.
    fn request_stop(&self, reason: StopReason) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveRun>,
    /// Cancel that arrived after the claim but before the run registered.
    pending_cancel: Option<TaskId>,
    closed: bool,
}

/// Removes the run from the slot however `run` exits.
struct SlotRelease<'a> {
    slot: &'a Mutex<Slot>,
    task_id: TaskId,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.active.as_ref().is_some_and(|a| a.task_id == self.task_id) {
            slot.active = None;
        }
    }
}

enum Trigger {
    Exit(ExitStatus),
    Deadline,
    Stop(StopReason),
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    slot: Mutex<Slot>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Task whose process is currently supervised.
    pub fn active_task(&self) -> Option<TaskId> {
        self.lock_slot().active.as_ref().map(|a| a.task_id)
    }

    /// Ask the run for `task_id` to stop. Returns false when that task is
    /// not the active run; the request is then held and applied if `task_id`
    /// is the next run to register.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut slot = self.lock_slot();
        match slot.active.as_ref() {
            Some(active) if active.task_id == *task_id => {
                info!(task_id = %task_id, "cancel requested for running agent");
                active.request_stop(StopReason::Cancel);
                true
            }
            _ => {
                slot.pending_cancel = Some(*task_id);
                false
            }
        }
    }

    /// Refuse new runs and stop the active one, if any.
    pub fn shutdown(&self) -> Option<TaskId> {
        let mut slot = self.lock_slot();
        slot.closed = true;
        let active = slot.active.as_ref()?;
        info!(task_id = %active.task_id, "stopping running agent for shutdown");
        active.request_stop(StopReason::Shutdown);
        Some(active.task_id)
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, task_id: TaskId) -> Result<watch::Receiver<Option<StopReason>>, RunFailure> {
        let mut slot = self.lock_slot();
        if slot.closed {
            return Err(RunFailure::ShuttingDown);
        }
        if let Some(active) = &slot.active {
            return Err(RunFailure::Busy {
                active: active.task_id,
            });
        }
        let cancelled_early = slot.pending_cancel.take() == Some(task_id);
        if cancelled_early {
            info!(task_id = %task_id, "cancel arrived before the agent started");
        }
        let (stop_tx, stop_rx) = watch::channel(cancelled_early.then_some(StopReason::Cancel));
        slot.active = Some(ActiveRun { task_id, stop_tx });
        Ok(stop_rx)
    }

    /// Run the agent for one task and wait for it to finish.
    pub async fn run(&self, request: RunRequest) -> Result<ExitReport, RunFailure> {
        let mut stop_rx = self.register(request.task_id)?;
        let _release = SlotRelease {
            slot: &self.slot,
            task_id: request.task_id,
        };
        self.drive(&request, &mut stop_rx).await
    }

    fn command(&self, request: &RunRequest) -> Command {
        let mut std_cmd = std::process::Command::new(&self.config.agent_path);
        std_cmd
            .arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string())
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn drive(
        &self,
        request: &RunRequest,
        stop_rx: &mut watch::Receiver<Option<StopReason>>,
    ) -> Result<ExitReport, RunFailure> {
        let started = Instant::now();
        let mut child = self.command(request).spawn().map_err(|source| RunFailure::Spawn {
            program: self.config.agent_path.display().to_string(),
            source,
        })?;
        let mut life = Lifecycle::spawned(request.task_id);

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));
        life.advance(Phase::Running);

        // a cancel may have landed between registering and spawning
        let early_stop = *stop_rx.borrow_and_update();
        let trigger = match early_stop {
            Some(reason) => Trigger::Stop(reason),
            None => {
                let deadline = tokio::time::sleep(self.config.timeout);
                tokio::select! {
                    status = child.wait() => Trigger::Exit(status?),
                    _ = deadline => Trigger::Deadline,
                    reason = next_stop(stop_rx) => Trigger::Stop(reason),
                }
            }
        };

        let (status, stop) = match trigger {
            Trigger::Exit(status) => {
                life.advance(Phase::Exited);
                (status, None)
            }
            Trigger::Deadline => {
                life.advance(Phase::TimedOut);
                warn!(
                    task_id = %request.task_id,
                    timeout = %human_duration(&self.config.timeout),
                    "agent timed out, terminating"
                );
                let (_, forced) = self.terminate(&mut child, &mut life).await?;
                stdout.abort();
                stderr.abort();
                return Err(RunFailure::TimedOut {
                    after: self.config.timeout,
                    forced,
                });
            }
            Trigger::Stop(reason) => {
                life.advance(Phase::Stopping(reason));
                let (status, forced) = self.terminate(&mut child, &mut life).await?;
                if reason == StopReason::Shutdown && exit_signal(&status).is_some() {
                    stdout.abort();
                    stderr.abort();
                    return Err(RunFailure::Interrupted { forced });
                }
                (status, Some(reason))
            }
        };

        let stdout = self.drain(stdout).await;
        let stderr = self.drain(stderr).await;
        let report = ExitReport {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(1),
            signal: exit_signal(&status),
            stop,
        };
        debug!(
            task_id = %request.task_id,
            exit_code = report.exit_code,
            signal = ?report.signal,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent exited"
        );
        Ok(report)
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(
        &self,
        child: &mut Child,
        life: &mut Lifecycle,
    ) -> Result<(ExitStatus, bool), RunFailure> {
        let pid = child.id();
        signal_group(pid, GroupSignal::Terminate);

        if let Ok(status) = tokio::time::timeout(self.config.grace_period, child.wait()).await {
            life.advance(Phase::Exited);
            return Ok((status?, false));
        }

        warn!(task_id = %life.task_id, "agent ignored SIGTERM, sending SIGKILL");
        signal_group(pid, GroupSignal::Kill);
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "start_kill after group kill");
        }
        let status = child.wait().await?;
        life.advance(Phase::Killed);
        Ok((status, true))
    }

    /// Collect a reader, giving up if a stray grandchild keeps the pipe open.
    async fn drain(&self, reader: JoinHandle<io::Result<Vec<u8>>>) -> Vec<u8> {
        let abort = reader.abort_handle();
        match tokio::time::timeout(self.config.grace_period, reader).await {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(err))) => {
                warn!(error = %err, "failed reading agent output");
                Vec::new()
            }
            Ok(Err(err)) => {
                warn!(error = %err, "agent output reader died");
                Vec::new()
            }
            Err(_) => {
                abort.abort();
                warn!("agent output pipe still open after exit, dropping it");
                Vec::new()
            }
        }
    }
}

async fn next_stop(stop_rx: &mut watch::Receiver<Option<StopReason>>) -> StopReason {
    loop {
        if stop_rx.changed().await.is_err() {
            // sender lives in the slot for the whole run
            return std::future::pending().await;
        }
        if let Some(reason) = *stop_rx.borrow_and_update() {
            return reason;
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, which: GroupSignal) {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let signal = match which {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);
    if let Err(err) = killpg(pid, signal) {
        debug!(error = %err, ?signal, "killpg failed, signalling leader only");
        let _ = kill(pid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _which: GroupSignal) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable `/bin/sh` script standing in for the agent.
    pub fn fake_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(format!("agent-{}.sh", ulid::Ulid::new()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
