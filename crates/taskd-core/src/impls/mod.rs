//! Impls - implementations of the ports.
//!
//! - **SqliteTaskStore**: the daemon's durable store
//! - **InMemoryTaskStore**: tests and embedding
//! - **HookNotifier**: runs a shell command per finished task

pub mod hook_notifier;
pub mod memory_store;
pub mod sqlite_store;

pub use self::hook_notifier::HookNotifier;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
