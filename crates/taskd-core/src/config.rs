//! Runtime knobs for the supervisor and the queue runner.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_millis(1_800_000);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_TURNS: u32 = 50;
pub const DEFAULT_PROJECT_DIR: &str = "/projects";

/// How the agent subprocess is launched and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Agent executable.
    pub agent_path: PathBuf,
    /// Passed as `--max-turns`.
    pub max_turns: u32,
    /// Wall-clock limit for one task.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_path: PathBuf::from("claude"),
            max_turns: DEFAULT_MAX_TURNS,
            timeout: DEFAULT_TASK_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    /// Working directory for tasks submitted without `project_dir`.
    pub default_project_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_project_dir: PathBuf::from(DEFAULT_PROJECT_DIR),
        }
    }
}
