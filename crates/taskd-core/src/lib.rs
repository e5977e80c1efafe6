//! taskd-core
//!
//! A single-worker queue that runs an AI coding agent as a subprocess, one
//! task at a time, and keeps every task's lifecycle in a durable store.
//!
//! # Modules
//! - **domain**: task record, status machine, run outcomes, notices
//! - **ports**: TaskStore, Notifier, Clock, IdGenerator
//! - **impls**: SQLite and in-memory stores, the shell-hook notifier
//! - **supervisor**: spawn / timeout / cancel of the agent process
//! - **parser**: agent JSON output into text and usage metrics
//! - **queue**: the polling runner
//! - **app**: the validated operations the daemon exposes

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod parser;
pub mod ports;
pub mod queue;
pub mod supervisor;

pub use error::TaskdError;
