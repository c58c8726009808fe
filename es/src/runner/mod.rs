//! Recurring task runner
//!
//! A [`TaskRunner`] drives one asynchronous unit of work (a collector poll, a
//! dispatcher drain) on a controlled cadence until it is stopped, reaches its
//! iteration cap, or fails. Lifecycle is reported as [`RunnerSignal`]s.

mod callback;
mod config;
mod retry;
mod service;

pub use callback::{FnTask, RunCallback, StopCallback, task_fn};
pub use config::RunnerConfig;
pub use retry::Retry;
pub use service::{RunHandle, RunnerSignal, TaskRunner};
