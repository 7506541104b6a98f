//! Error types shared by the worker, the scheduler and the config layer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure while bringing up a [`ProcessWorker`](crate::worker::ProcessWorker).
///
/// Every handle created before the failure has already been released by the
/// time this error reaches the caller.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("inference executable not found: {0}")]
    MissingExecutable(PathBuf),

    #[error("failed to create {which} pipe: {source}")]
    Pipe {
        which: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start pipe reader thread: {0}")]
    ReaderThread(#[source] io::Error),
}

/// Failure of an operation on a live worker.
///
/// Read-side problems are never reported here; they end the exchange and
/// show up as a [`Termination`](crate::worker::Termination) instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker is closed")]
    Closed,

    #[error("failed to write prompt to child stdin: {0}")]
    Write(#[source] io::Error),
}

/// Failure of a [`TaskScheduler`](crate::scheduler::TaskScheduler) operation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Submission after shutdown began. Nothing was enqueued.
    #[error("scheduler is closed")]
    Closed,

    #[error("thread count must be at least 1")]
    InvalidThreadCount,

    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failure observed through a [`TaskHandle`](crate::scheduler::TaskHandle).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The job was dropped without running, so no result will ever arrive.
    #[error("task was abandoned before completing")]
    Abandoned,

    #[error("timed out waiting for task result")]
    TimedOut,
}

/// Failure while loading [`AppConfig`](crate::config::AppConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}
