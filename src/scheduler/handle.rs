//! Completion handle returned by [`TaskScheduler::submit`](super::TaskScheduler::submit).

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::TaskError;

/// Receiving end of one task's result.
///
/// The pool thread sends exactly one value. If the job is dropped without
/// running, waiting reports [`TaskError::Abandoned`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(rx: Receiver<Result<T, TaskError>>) -> Self {
        Self { rx }
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Block for at most `timeout`. On [`TaskError::TimedOut`] the handle is
    /// still usable and can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TaskError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Abandoned),
        }
    }

    /// The result if it is already available.
    pub fn try_wait(&self) -> Option<Result<T, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }
}
