//! Drive long-lived `llama-cli` style inference processes over pipes, and
//! fan prompt exchanges out across a fixed pool of threads.
//!
//! The two halves are independent:
//! - [`worker::ProcessWorker`] owns one child process and its pipes
//! - [`scheduler::TaskScheduler`] runs arbitrary closures on N threads
//!
//! Callers compose them, typically by sharing each worker behind a
//! [`worker::SharedWorker`] and submitting closures that lock it and prompt.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod worker;

pub use config::{AppConfig, StopMarkers, WorkerConfig};
pub use error::{ConfigError, LaunchError, SchedulerError, TaskError, WorkerError};
pub use scheduler::{TaskHandle, TaskScheduler};
pub use worker::{ProcessWorker, PromptOptions, PromptOutput, SharedWorker, Termination};
