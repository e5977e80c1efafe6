//! Ports - the seams between the runner and the outside world.

pub mod clock;
pub mod id_generator;
pub mod notifier;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notifier::{NoopNotifier, Notifier, NotifyError};
pub use self::task_store::{DeleteOutcome, StoreError, TaskStore};
