//! Notifier port - tells someone a task finished.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Notice;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to launch notifier: {0}")]
    Launch(#[from] std::io::Error),

    #[error("notifier exited with {0}")]
    Exit(String),

    #[error("notifier timed out")]
    Timeout,
}

/// Delivery of terminal-state notices.
///
/// The runner calls this at most once per task and only marks the task as
/// notified when `send` succeeds. Errors are logged by the caller and never
/// retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Disabled notifiers are skipped without touching the `notified` flag.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Used when no notification channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send(&self, _notice: &Notice) -> Result<(), NotifyError> {
        Ok(())
    }
}
