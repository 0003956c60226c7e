/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Thread pool: dispatches work items to worker threads with per-worker
//! bounded queues. `original_source/src/threadpool.c`'s `SIGUSR1`-driven
//! wakeup is replaced with one `Condvar` per worker, and its hand-rolled
//! 8-bit CAS ring is replaced with `crossbeam_queue::ArrayQueue`, which gives
//! the same "0 <= len <= capacity, full vs. empty unambiguous" contract
//! without reimplementing lock-free cursor arithmetic by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;

/// Capacity of each worker's ring queue.
pub const QUEUE_CAPACITY: usize = 256;

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    queue: ArrayQueue<WorkItem>,
    cond: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicBool,
}

/// Fixed-size pool of worker threads. The producer (whichever thread calls
/// [`ThreadPool::submit`], normally the reactor thread) picks a worker by
/// round robin and pushes one work item onto its queue.
pub struct ThreadPool {
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

#[derive(Debug)]
pub struct QueueFullError;

impl std::fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker queue is full")
    }
}

impl std::error::Error for QueueFullError {}

impl ThreadPool {
    /// Spawns `num_threads` workers and blocks (via a counting `Condvar`,
    /// replacing the original's `sigwait`-based startup barrier) until all
    /// of them have registered.
    pub fn new(num_threads: usize, name_prefix: &str) -> Self {
        assert!(num_threads > 0, "thread pool needs at least one worker");

        let started = Arc::new((Mutex::new(0usize), Condvar::new()));
        let mut workers = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for idx in 0..num_threads {
            let worker = Arc::new(Worker {
                queue: ArrayQueue::new(QUEUE_CAPACITY),
                cond: Condvar::new(),
                mutex: Mutex::new(()),
                shutdown: AtomicBool::new(false),
            });
            workers.push(Arc::clone(&worker));

            let started = Arc::clone(&started);
            let handle = std::thread::Builder::new()
                .name(format!("{name_prefix}-{idx}"))
                .spawn(move || {
                    {
                        let (lock, cvar) = &*started;
                        let mut count = lock.lock().unwrap();
                        *count += 1;
                        cvar.notify_all();
                    }
                    worker_loop(&worker);
                })
                .expect("failed to spawn thread pool worker");
            handles.push(handle);
        }

        {
            let (lock, cvar) = &*started;
            let mut count = lock.lock().unwrap();
            while *count < num_threads {
                count = cvar.wait(count).unwrap();
            }
        }

        ThreadPool { workers, handles, next: AtomicUsize::new(0) }
    }

    /// Submits one work item to the next worker in round-robin order. If
    /// that worker's queue is already at `QUEUE_CAPACITY`, the item is
    /// dropped and `Err` is returned so the caller can log a warning. The
    /// work is dropped outright, not retried or rerouted to a different
    /// worker.
    pub fn submit<F>(&self, work: F) -> Result<(), QueueFullError>
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[idx];
        match worker.queue.push(Box::new(work)) {
            Ok(()) => {
                let _guard = worker.mutex.lock().unwrap();
                worker.cond.notify_one();
                Ok(())
            }
            Err(_) => Err(QueueFullError),
        }
    }

    #[cfg(test)]
    fn queue_len(&self, idx: usize) -> usize {
        self.workers[idx].queue.len()
    }

    /// Waits for every queue to drain, sets each worker's shutdown flag,
    /// wakes them, and joins. Workers already
    /// mid-task run to completion; no new work may be submitted once this
    /// starts racing with `submit` (callers are expected to stop producing
    /// before calling `shutdown`).
    pub fn shutdown(mut self) {
        loop {
            if self.workers.iter().all(|w| w.queue.is_empty()) {
                break;
            }
            std::thread::yield_now();
        }
        for worker in &self.workers {
            worker.shutdown.store(true, Ordering::Release);
            let _guard = worker.mutex.lock().unwrap();
            worker.cond.notify_one();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker: &Worker) {
    loop {
        // Drain whatever is already queued before considering sleep or
        // shutdown, matching the original's "drain queue, then check
        // shutdown" ordering in `tpool_thread`.
        while let Some(work) = worker.queue.pop() {
            work();
        }

        if worker.shutdown.load(Ordering::Acquire) {
            return;
        }

        let guard = worker.mutex.lock().unwrap();
        if worker.queue.is_empty() && !worker.shutdown.load(Ordering::Acquire) {
            let _guard = worker
                .cond
                .wait_timeout(guard, std::time::Duration::from_millis(500))
                .unwrap()
                .0;
        }
    }
}
