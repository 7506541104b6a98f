// TaskScheduler ordering, shutdown and composition tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use llama_cli_pool::{
    ProcessWorker, PromptOptions, SchedulerError, SharedWorker, TaskScheduler, WorkerConfig,
};

/// Occupies one pool thread until the returned sender is used or dropped.
fn block_one_thread(pool: &TaskScheduler) -> mpsc::Sender<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    pool.submit(move || {
        started_tx.send(()).unwrap();
        let _ = release_rx.recv();
    })
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    release_tx
}

#[test]
fn test_single_thread_completes_in_submission_order() {
    let pool = TaskScheduler::new(1).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().unwrap().push(i)).unwrap()
        })
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_multi_thread_pool_dequeues_fifo() {
    let pool = TaskScheduler::new(3).unwrap();
    // Park every thread, queue the work, then let exactly one thread serve it
    let gates: Vec<_> = (0..3).map(|_| block_one_thread(&pool)).collect();

    let order = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().unwrap().push(i)).unwrap()
        })
        .collect();
    assert_eq!(pool.pending(), 20);

    gates[0].send(()).unwrap();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());

    drop(gates);
    pool.shutdown();
}

#[test]
fn test_every_task_runs_exactly_once() {
    let pool = TaskScheduler::new(4).unwrap();
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let runs = Arc::clone(&runs);
            pool.submit(move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                i * 2
            })
            .unwrap()
        })
        .collect();

    let results: Vec<usize> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    assert_eq!(results, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_concurrency_is_bounded_by_thread_count() {
    let pool = TaskScheduler::new(3).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency was {peak}");
}

#[test]
fn test_submit_after_shutdown_always_fails() {
    let pool = TaskScheduler::new(2).unwrap();
    pool.shutdown();

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let ran = Arc::clone(&ran);
        let result = pool.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Err(SchedulerError::Closed)));
    }
    assert_eq!(pool.pending(), 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shutdown_drains_queued_tasks() {
    let pool = Arc::new(TaskScheduler::new(1).unwrap());
    let gate = block_one_thread(&pool);

    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    let shutdown = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.shutdown())
    };

    // Shutdown has begun once the pool reports closed
    while !pool.is_closed() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(pool.submit(|| ()), Err(SchedulerError::Closed)));

    gate.send(()).unwrap();
    shutdown.join().unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 10);
    for handle in handles {
        assert_eq!(handle.try_wait(), Some(Ok(())));
    }
}

#[test]
fn test_concurrent_shutdowns_both_wait_for_running_job() {
    let pool = Arc::new(TaskScheduler::new(1).unwrap());
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            thread::sleep(Duration::from_millis(20));
            finished.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let shutdown_on_thread = || {
        let pool = Arc::clone(&pool);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            pool.shutdown();
            finished.load(Ordering::SeqCst)
        })
    };

    let first = shutdown_on_thread();
    while !pool.is_closed() {
        thread::sleep(Duration::from_millis(1));
    }
    // Give the first caller time to take the thread handles
    thread::sleep(Duration::from_millis(50));
    let second = shutdown_on_thread();

    thread::sleep(Duration::from_millis(100));
    assert!(!second.is_finished(), "second shutdown returned while a job was running");
    assert!(!first.is_finished());

    release_tx.send(()).unwrap();
    assert!(first.join().unwrap(), "first shutdown returned before the job finished");
    assert!(second.join().unwrap(), "second shutdown returned before the job finished");
}

#[test]
fn test_shutdown_from_inside_a_job_does_not_deadlock() {
    let pool = Arc::new(TaskScheduler::new(2).unwrap());
    let handle = {
        let inner = Arc::clone(&pool);
        pool.submit(move || inner.shutdown()).unwrap()
    };
    handle.wait().unwrap();
    assert!(pool.is_closed());
    pool.shutdown();
}

#[test]
fn test_dropped_handle_does_not_disturb_pool() {
    let pool = TaskScheduler::new(1).unwrap();
    drop(pool.submit(|| "ignored").unwrap());
    assert_eq!(pool.submit(|| "kept").unwrap().wait(), Ok("kept"));
}

#[test]
fn test_shared_worker_through_scheduler() {
    let mut config = WorkerConfig::new(env!("CARGO_BIN_EXE_mock_llama_cli"), "models/mock.gguf");
    config.prompt_timeout_ms = Some(10_000);

    let workers: Vec<SharedWorker> = (0..2)
        .map(|_| Arc::new(Mutex::new(ProcessWorker::spawn(config.clone()).unwrap())))
        .collect();
    let pool = TaskScheduler::new(4).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let worker = Arc::clone(&workers[i % workers.len()]);
            let text = format!("prompt number {i}");
            pool.submit(move || {
                let mut worker = worker.lock().unwrap();
                let output = worker.prompt_with(&text, PromptOptions::default()).unwrap();
                (text, output)
            })
            .unwrap()
        })
        .collect();

    for handle in handles {
        let (sent, output) = handle.wait().unwrap();
        assert!(output.is_complete());
        assert_eq!(output.text, sent);
    }
    pool.shutdown();
}
