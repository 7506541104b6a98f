//! Fixed-size thread pool over one FIFO queue.
//!
//! Submitters append boxed jobs under the queue mutex and wake one thread.
//! Each pool thread pops the head and runs it outside the lock. Shutdown
//! closes the queue to new work, lets the threads drain what is already
//! queued, and waits until every thread has left its loop.

use std::any::Any;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, info, warn};

use super::handle::TaskHandle;
use crate::error::{SchedulerError, TaskError};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
    /// Pool threads that have not yet left `worker_loop`.
    live: usize,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
    /// Signalled each time a pool thread exits.
    exited: Condvar,
}

impl Shared {
    /// Jobs never run under the lock, so a poisoned mutex still holds a
    /// consistent queue.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded-concurrency scheduler for blocking work.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
    thread_count: usize,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("thread_count", &self.thread_count)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskScheduler {
    /// Start `threads` pool threads.
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        if threads == 0 {
            return Err(SchedulerError::InvalidThreadCount);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
                live: 0,
            }),
            available: Condvar::new(),
            exited: Condvar::new(),
        });

        let mut scheduler = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(threads)),
            thread_ids: Vec::with_capacity(threads),
            thread_count: threads,
        };

        for index in 0..threads {
            let shared = Arc::clone(&scheduler.shared);
            scheduler.shared.lock().live += 1;
            let spawned = thread::Builder::new()
                .name(format!("task-pool-{index}"))
                .spawn(move || worker_loop(&shared, index));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("[TASK_POOL] Failed to spawn thread #{index}: {e}");
                    scheduler.shared.lock().live -= 1;
                    // Dropping `scheduler` shuts down the threads already started.
                    return Err(SchedulerError::Spawn(e));
                }
            };
            scheduler.thread_ids.push(handle.thread().id());
            scheduler.lock_threads().push(handle);
        }

        info!("[TASK_POOL] Started {threads} threads");
        Ok(scheduler)
    }

    /// One thread per unit of hardware parallelism.
    pub fn with_default_threads() -> Result<Self, SchedulerError> {
        Self::new(default_thread_count())
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Jobs queued and not yet picked up by a thread.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Queue `f` and return a handle to its result. Never blocks on the work
    /// itself.
    ///
    /// A panic inside `f` is caught and reported through the handle as
    /// [`TaskError::Panicked`]; the pool thread keeps running.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            // The caller may have dropped the handle.
            let _ = tx.send(result);
        });

        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(SchedulerError::Closed);
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle::new(rx))
    }

    /// Stop accepting work, run everything already queued, and wait for every
    /// pool thread to exit.
    ///
    /// Every caller blocks until the threads are gone, including concurrent
    /// and repeated calls. Called from a job on one of the pool's own
    /// threads, it only closes the queue: that thread cannot wait for itself.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            if !queue.closed {
                debug!("[TASK_POOL] Shutdown requested, {} jobs pending", queue.jobs.len());
            }
            queue.closed = true;
        }
        self.shared.available.notify_all();

        if self.thread_ids.contains(&thread::current().id()) {
            debug!("[TASK_POOL] Shutdown from a pool thread, not waiting");
            return;
        }

        // The first caller takes the handles; everyone waits on `live`.
        let handles: Vec<JoinHandle<()>> = self.lock_threads().drain(..).collect();
        let joined = !handles.is_empty();
        for handle in handles {
            if handle.join().is_err() {
                warn!("[TASK_POOL] Pool thread panicked");
            }
        }

        let mut queue = self.shared.lock();
        while queue.live > 0 {
            queue = self
                .shared
                .exited
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(queue);

        if joined {
            info!("[TASK_POOL] All threads stopped");
        }
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    debug!("[TASK_POOL] Thread #{index} started");
    loop {
        let job = {
            let mut queue = shared.lock();
            while queue.jobs.is_empty() && !queue.closed {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                // Closed and drained
                None => break,
            }
        };
        job();
    }
    shared.lock().live -= 1;
    shared.exited.notify_all();
    debug!("[TASK_POOL] Thread #{index} exiting");
}

fn default_thread_count() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
