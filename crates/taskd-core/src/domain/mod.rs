//! Domain model (ids, task record, status machine, run outcomes, notices).

pub mod ids;
pub mod notice;
pub mod outcome;
pub mod state;
pub mod task;

pub use ids::{ParseTaskIdError, TaskId};
pub use notice::Notice;
pub use outcome::{ExitReport, StopReason};
pub use state::{ParseStatusError, TaskStatus};
pub use task::{
    ListFilter, NewTask, RecoveryReport, RunRecord, Task, TaskCounts, TaskPage, TaskUpdate,
};
