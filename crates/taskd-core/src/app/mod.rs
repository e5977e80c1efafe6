//! App - the operations the daemon serves, built on the ports.
//!
//! - **TaskService**: submit / list / get / delete / cancel / status
//! - **DaemonStatus**: the status snapshot

pub mod service;
pub mod status;

pub use self::service::{CancelOutcome, ListQuery, Submission, TaskService};
pub use self::status::DaemonStatus;
