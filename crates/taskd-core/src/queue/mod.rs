//! Queue: the polling runner that moves tasks from pending to a terminal state.

pub mod runner;

pub use self::runner::{QueueRunner, TickOutcome};
