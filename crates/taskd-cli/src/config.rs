//! Command line and environment configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use taskd_core::config::{
    DEFAULT_GRACE_PERIOD, DEFAULT_PROJECT_DIR, RunnerConfig, SupervisorConfig,
};
use tracing::{info, warn};

const PLACEHOLDER_TOKEN: &str = "change-me-to-a-random-secret";

#[derive(Parser, Debug, Clone)]
#[command(name = "taskd", about = "Single-worker task queue for a coding agent")]
pub struct Cli {
    /// Address to bind the HTTP API on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3456)]
    pub port: u16,

    /// Shared secret for the API
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Agent executable (discovered when unset)
    #[arg(long, env = "CLAUDE_PATH")]
    pub claude_path: Option<PathBuf>,

    /// Working directory for tasks without project_dir
    #[arg(long, env = "DEFAULT_PROJECT_DIR", default_value = DEFAULT_PROJECT_DIR)]
    pub default_project_dir: PathBuf,

    #[arg(long, env = "MAX_TURNS", default_value_t = 50)]
    pub max_turns: u32,

    /// Per-task wall-clock limit in milliseconds
    #[arg(long, env = "TASK_TIMEOUT_MS", default_value_t = 1_800_000)]
    pub task_timeout_ms: u64,

    /// SQLite database file
    #[arg(long, env = "DB_PATH", default_value = "/data/daemon.db")]
    pub db_path: PathBuf,

    /// Shell command run once per finished task
    #[arg(long, env = "TASKD_NOTIFY_HOOK")]
    pub notify_hook: Option<String>,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// The auth token, refusing a missing value or the sample placeholder.
    pub fn auth_token(&self) -> Result<String> {
        match self.auth_token.as_deref().map(str::trim) {
            None | Some("") => bail!("AUTH_TOKEN is required"),
            Some(PLACEHOLDER_TOKEN) => {
                bail!("AUTH_TOKEN is still the placeholder value; set a random secret")
            }
            Some(token) => Ok(token.to_string()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            agent_path: find_agent(self.claude_path.as_deref(), &agent_candidates()),
            max_turns: self.max_turns,
            timeout: Duration::from_millis(self.task_timeout_ms),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            default_project_dir: self.default_project_dir.clone(),
        }
    }
}

fn agent_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".npm-global/bin/claude"));
    }
    candidates
}

/// First existing candidate wins, then `$PATH`, then the bare name.
fn find_agent(explicit: Option<&Path>, candidates: &[PathBuf]) -> PathBuf {
    if let Some(path) = explicit
        && path.exists()
    {
        return path.to_path_buf();
    }
    if let Some(found) = candidates.iter().find(|p| p.exists()) {
        return found.clone();
    }
    which::which("claude").unwrap_or_else(|_| PathBuf::from("claude"))
}

/// Log which agent credentials are visible to the worker.
pub fn report_agent_auth() {
    let has_key = env::var("ANTHROPIC_API_KEY").is_ok_and(|k| !k.is_empty());
    let has_login = dirs::home_dir().is_some_and(|home| home.join(".claude").exists());
    match (has_key, has_login) {
        (true, _) => info!("agent auth: ANTHROPIC_API_KEY"),
        (false, true) => info!("agent auth: ~/.claude login"),
        (false, false) => warn!("no agent auth found (ANTHROPIC_API_KEY or ~/.claude); tasks will likely fail"),
    }
}
