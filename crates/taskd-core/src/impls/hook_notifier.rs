//! Notifier that hands each notice to a user-supplied shell command.
//!
//! The command runs under `sh -c` with the notice fields in `TASKD_NOTIFY_*`
//! environment variables and the whole notice as JSON on stdin, so it can
//! mail, post to a chat webhook, or anything else.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::Notice;
use crate::ports::{Notifier, NotifyError};

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HookNotifier {
    command: String,
    timeout: Duration,
}

impl HookNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, notice: &Notice) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        cmd.env("TASKD_NOTIFY_TASK_ID", notice.task_id.to_string());
        cmd.env("TASKD_NOTIFY_STATUS", notice.status.as_str());
        cmd.env("TASKD_NOTIFY_SUBJECT", &notice.subject);
        cmd.env("TASKD_NOTIFY_DURATION", &notice.duration);
        if let Some(code) = notice.exit_code {
            cmd.env("TASKD_NOTIFY_EXIT_CODE", code.to_string());
        }
        if let Some(dir) = &notice.project_dir {
            cmd.env("TASKD_NOTIFY_PROJECT_DIR", dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Notifier for HookNotifier {
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(notice).map_err(std::io::Error::other)?;
        let mut child = self.build_command(notice).spawn()?;
        let stdin = child.stdin.take();

        let feed = async move {
            let Some(mut stdin) = stdin else { return };
            // a hook that ignores stdin may close it early
            if let Err(err) = stdin.write_all(&payload).await {
                debug!(error = %err, "notify hook did not read stdin");
            }
        };
        // the write shares the deadline: a hook that never reads would block it
        // forever once the pipe fills. On expiry the child is dropped and killed.
        let run = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| NotifyError::Timeout)??;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        Err(NotifyError::Exit(if stderr.is_empty() {
            output.status.to_string()
        } else {
            format!("{}: {stderr}", output.status)
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Task, TaskId, TaskStatus, TaskUpdate};
    use chrono::Utc;
    use ulid::Ulid;

    fn notice() -> Notice {
        notice_for("tidy imports")
    }

    fn notice_for(prompt: &str) -> Notice {
        let now = Utc::now();
        let mut task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask {
                prompt: prompt.into(),
                project_dir: None,
            },
            now,
        );
        TaskUpdate::claim(now).apply(&mut task);
        TaskUpdate::finish(TaskStatus::Completed, Default::default(), now).apply(&mut task);
        Notice::for_task(&task)
    }

    #[tokio::test]
    async fn hook_receives_env_and_json_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let cmd = format!(
            "printf '%s\\n' \"$TASKD_NOTIFY_STATUS\" > {0}; cat >> {0}",
            out.display()
        );
        let notice = notice();

        HookNotifier::new(cmd).send(&notice).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let (status, json) = written.split_once('\n').unwrap();
        assert_eq!(status, "completed");
        let payload: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(payload["task_id"], notice.task_id.to_string());
        assert_eq!(payload["subject"], "[taskd] Completed: tidy imports");
    }

    #[tokio::test]
    async fn failing_hook_reports_stderr() {
        let err = HookNotifier::new("echo smtp down >&2; exit 3")
            .send(&notice())
            .await
            .unwrap_err();
        match err {
            NotifyError::Exit(msg) => assert!(msg.contains("smtp down"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_hook_times_out() {
        let err = HookNotifier::new("sleep 5")
            .with_timeout(Duration::from_millis(100))
            .send(&notice())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Timeout));
    }

    #[tokio::test]
    async fn deadline_covers_a_payload_the_hook_never_reads() {
        let notice = notice_for(&"😀".repeat(10_000));
        assert!(serde_json::to_vec(&notice).unwrap().len() > 64 * 1024);

        let began = std::time::Instant::now();
        let err = HookNotifier::new("sleep 5")
            .with_timeout(Duration::from_millis(200))
            .send(&notice)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Timeout), "{err:?}");
        assert!(began.elapsed() < Duration::from_secs(3));
    }
}
