// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Fixed-size worker thread pool
//!
//! Jobs are a shared function plus one argument and a priority tag. They sit
//! in a FIFO job queue guarded by a mutex; a counting semaphore signals
//! non-emptiness so idle workers block instead of spinning. The pool never
//! reorders jobs: priority is decided by whoever submits.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use beacon_relay::{JobFn, WorkerPool};
//!
//! let pool: WorkerPool<usize> = WorkerPool::new(2).unwrap();
//! let total = Arc::new(AtomicUsize::new(0));
//! let sum: JobFn<usize> = {
//!     let total = Arc::clone(&total);
//!     Arc::new(move |n: usize| {
//!         total.fetch_add(n, Ordering::SeqCst);
//!     })
//! };
//! for n in 1..=4 {
//!     pool.submit(sum.clone(), n, 0).unwrap();
//! }
//! pool.shutdown();
//! assert_eq!(total.load(Ordering::SeqCst), 10);
//! ```

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::PoolError;
use crate::list::IndexQueue;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Identifier of the pool worker running on this thread, if any
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(|id| id.get())
}

/// Function shared by every job of one kind
pub type JobFn<A> = Arc<dyn Fn(A) + Send + Sync>;

/// One unit of work: a function, its argument and a priority tag
pub struct Job<A> {
    function: JobFn<A>,
    arg: A,
    priority: u32,
}

impl<A> Job<A> {
    /// Bundle a function with its argument
    pub fn new(function: JobFn<A>, arg: A, priority: u32) -> Self {
        Self {
            function,
            arg,
            priority,
        }
    }

    /// Priority the submitter attached to this job
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Borrow the argument
    pub fn arg(&self) -> &A {
        &self.arg
    }

    /// Drop the function and keep the argument
    pub fn into_arg(self) -> A {
        self.arg
    }

    fn run(self) {
        (self.function)(self.arg)
    }
}

impl<A> fmt::Debug for Job<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Submission refused because the pool is shutting down
///
/// Carries the job back so its argument is not lost.
#[derive(Error)]
#[error("worker pool is shutting down")]
pub struct Rejected<A>(pub Job<A>);

impl<A> Rejected<A> {
    /// Recover the rejected job's argument
    pub fn into_arg(self) -> A {
        self.0.into_arg()
    }
}

impl<A> fmt::Debug for Rejected<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejected").field(&self.0).finish()
    }
}

/// Counting semaphore
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}

struct JobQueue<A> {
    jobs: IndexQueue<Job<A>>,
    keep_alive: bool,
}

#[derive(Default)]
struct ThreadCounts {
    alive: usize,
    working: usize,
}

struct Shared<A> {
    queue: Mutex<JobQueue<A>>,
    semaphore: Semaphore,
    counts: Mutex<ThreadCounts>,
    counts_changed: Condvar,
    executed: AtomicU64,
    panicked: AtomicU64,
}

impl<A> Shared<A> {
    fn worker_loop(&self, id: usize) {
        WORKER_ID.with(|cell| cell.set(Some(id)));
        {
            let mut counts = self.counts.lock();
            counts.alive += 1;
            self.counts_changed.notify_all();
        }

        loop {
            self.semaphore.acquire();

            let job = {
                let mut queue = self.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None if queue.keep_alive => continue,
                    None => break,
                }
            };

            self.counts.lock().working += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
            self.counts.lock().working -= 1;

            self.executed.fetch_add(1, Ordering::Relaxed);
            if outcome.is_err() {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                log::error!("worker {}: job panicked", id);
            }
        }

        let mut counts = self.counts.lock();
        counts.alive -= 1;
        self.counts_changed.notify_all();
        log::debug!("worker {} exiting", id);
    }

    /// Stop accepting jobs. Returns false if the pool was already stopping.
    fn close(&self) -> bool {
        let mut queue = self.queue.lock();
        std::mem::replace(&mut queue.keep_alive, false)
    }
}

/// Fixed set of threads executing submitted jobs in FIFO order
pub struct WorkerPool<A: Send + 'static> {
    shared: Arc<Shared<A>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl<A: Send + 'static> WorkerPool<A> {
    /// Start `n_threads` workers and wait until all of them are live
    pub fn new(n_threads: usize) -> Result<Self, PoolError> {
        if n_threads == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue {
                jobs: IndexQueue::with_capacity(n_threads * 4),
                keep_alive: true,
            }),
            semaphore: Semaphore::new(),
            counts: Mutex::new(ThreadCounts::default()),
            counts_changed: Condvar::new(),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(n_threads);
        for id in 0..n_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("relay-worker-{}", id))
                .spawn(move || worker_shared.worker_loop(id));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.close();
                    shared.semaphore.release(handles.len());
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PoolError::StartFailure {
                        worker: id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        {
            let mut counts = shared.counts.lock();
            while counts.alive < n_threads {
                shared.counts_changed.wait(&mut counts);
            }
        }
        log::info!("worker pool started with {} threads", n_threads);

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            size: n_threads,
        })
    }

    /// Queue `function(arg)` for execution
    pub fn submit(&self, function: JobFn<A>, arg: A, priority: u32) -> Result<(), Rejected<A>> {
        self.submit_job(Job::new(function, arg, priority))
    }

    /// Queue a prepared job for execution
    pub fn submit_job(&self, job: Job<A>) -> Result<(), Rejected<A>> {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.keep_alive {
                return Err(Rejected(job));
            }
            queue.jobs.push_back(job);
        }
        self.shared.semaphore.release(1);
        Ok(())
    }

    /// Stop accepting jobs, let the workers drain the queue, and join them.
    ///
    /// Returns the arguments of jobs that were still queued after every
    /// worker exited; this is empty unless a worker thread died.
    pub fn shutdown(&self) -> Vec<A> {
        if self.shared.close() {
            log::info!("worker pool shutting down");
            self.shared.semaphore.release(self.size);
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("worker thread terminated abnormally");
            }
        }

        let mut queue = self.shared.queue.lock();
        let mut leftover = Vec::new();
        while let Some(job) = queue.jobs.pop_front() {
            leftover.push(job.into_arg());
        }
        if !leftover.is_empty() {
            log::warn!("{} jobs left unexecuted at shutdown", leftover.len());
        }
        leftover
    }

    /// True until shutdown starts
    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().keep_alive
    }

    /// Number of worker threads the pool was started with
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently alive
    pub fn alive_count(&self) -> usize {
        self.shared.counts.lock().alive
    }

    /// Workers currently executing a job
    pub fn working_count(&self) -> usize {
        self.shared.counts.lock().working
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Jobs run to completion (panicked ones included)
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Jobs that panicked
    pub fn panicked(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }
}

impl<A: Send + 'static> Drop for WorkerPool<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<A: Send + 'static> fmt::Debug for WorkerPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("alive", &self.alive_count())
            .field("working", &self.working_count())
            .field("queued", &self.queued())
            .finish()
    }
}
