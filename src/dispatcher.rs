// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Starvation-bounded dispatcher
//!
//! The [`Dispatcher`] is a single control loop moving work records from the
//! [`BufferSet`] into the [`WorkerPool`]. Every iteration runs two passes:
//!
//! 1. **Forward pass**: walk the priority list from the highest weight down,
//!    dispatch the head of the first non-empty queue, and repeat until no
//!    queue yields work or the starvation timeout (T_max) has elapsed since
//!    the pass started.
//! 2. **Reverse pass**: walk the list once from the lowest weight up and
//!    dispatch the head of the first non-empty queue.
//!
//! The reverse pass runs on every iteration, so a record in the lowest
//! queue waits at most one forward window plus one reverse pass, whatever
//! the high-priority load. When neither pass finds work the loop sleeps for
//! the idle interval.
//!
//! On exit the dispatcher shuts the pool down (in-flight and queued jobs run
//! to completion) and releases every record still sitting in a buffer queue
//! back to the arena.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arena::Arena;
use crate::buffer::{BufferSet, Pass, QueueId};
use crate::pool::{JobFn, WorkerPool};
use crate::record::WorkRecord;
use crate::shutdown::ShutdownFlag;

/// Callback invoked after each successful dispatch
pub type DispatchObserver = Arc<dyn Fn(QueueId, Pass) + Send + Sync>;

/// Dispatcher counters, shared with whoever wants to watch them
#[derive(Debug, Default)]
pub struct DispatchCounters {
    forward: AtomicU64,
    reverse: AtomicU64,
    idle_sleeps: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    released_on_shutdown: AtomicU64,
}

impl DispatchCounters {
    /// Snapshot of the counters
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            forward_dispatches: self.forward.load(Ordering::Relaxed),
            reverse_dispatches: self.reverse.load(Ordering::Relaxed),
            idle_sleeps: self.idle_sleeps.load(Ordering::Relaxed),
            forward_timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            released_on_shutdown: self.released_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time dispatcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records dispatched by forward passes
    pub forward_dispatches: u64,
    /// Records dispatched by reverse passes
    pub reverse_dispatches: u64,
    /// Iterations that found no work
    pub idle_sleeps: u64,
    /// Forward passes cut short by the starvation timeout
    pub forward_timeouts: u64,
    /// Submissions the worker pool refused
    pub rejected: u64,
    /// Records released to the arena during shutdown
    pub released_on_shutdown: u64,
}

impl DispatchStats {
    /// Records dispatched by either pass
    pub fn total_dispatches(&self) -> u64 {
        self.forward_dispatches + self.reverse_dispatches
    }
}

/// What one dispatcher iteration did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Records dispatched by the forward pass
    pub forward: usize,
    /// Whether the forward pass hit the starvation timeout
    pub timed_out: bool,
    /// Whether the reverse pass dispatched a record
    pub reverse: bool,
}

impl CycleOutcome {
    /// True when neither pass found work
    pub fn is_idle(&self) -> bool {
        self.forward == 0 && !self.reverse
    }
}

/// Moves records from buffer queues into the worker pool
pub struct Dispatcher {
    buffers: Arc<BufferSet>,
    pool: Arc<WorkerPool<WorkRecord>>,
    arena: Arena,
    shutdown: ShutdownFlag,
    starvation_timeout: Duration,
    idle_interval: Duration,
    jobs: Vec<JobFn<WorkRecord>>,
    counters: Arc<DispatchCounters>,
    observer: Option<DispatchObserver>,
}

impl Dispatcher {
    /// Create a dispatcher over `buffers`, feeding `pool`
    pub fn new(
        buffers: Arc<BufferSet>,
        pool: Arc<WorkerPool<WorkRecord>>,
        arena: Arena,
        shutdown: ShutdownFlag,
        starvation_timeout: Duration,
        idle_interval: Duration,
    ) -> Self {
        // One job function per queue, wrapping its handler.
        let jobs = buffers
            .queues()
            .map(|queue| {
                let handler = queue.handler();
                let downstream = Arc::clone(&buffers);
                let job: JobFn<WorkRecord> =
                    Arc::new(move |record| handler.process(record, &downstream));
                job
            })
            .collect();

        Self {
            buffers,
            pool,
            arena,
            shutdown,
            starvation_timeout,
            idle_interval,
            jobs,
            counters: Arc::new(DispatchCounters::default()),
            observer: None,
        }
    }

    /// Call `observer` after each successful dispatch
    pub fn with_observer(mut self, observer: DispatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Shared handle to the dispatcher counters
    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    /// Dispatch the head of the first non-empty queue met in `pass` order.
    ///
    /// Returns the queue the record came from, or `None` when every queue was
    /// empty or the pool refused the job.
    pub fn dispatch_next(&self, pass: Pass) -> Option<QueueId> {
        let (id, record) = self.buffers.pop_next(pass)?;
        let queue = self.buffers.queue(id)?;

        match self
            .pool
            .submit(Arc::clone(&self.jobs[id.0]), record, queue.weight())
        {
            Ok(()) => {
                match pass {
                    Pass::Forward => self.counters.forward.fetch_add(1, Ordering::Relaxed),
                    Pass::Reverse => self.counters.reverse.fetch_add(1, Ordering::Relaxed),
                };
                log::trace!("dispatched from '{}' ({:?} pass)", queue.name(), pass);
                if let Some(observer) = &self.observer {
                    observer(id, pass);
                }
                Some(id)
            }
            Err(rejected) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let record = rejected.into_arg();
                if self.shutdown.is_requested() {
                    self.release(record);
                } else {
                    log::warn!(
                        "worker pool rejected job from '{}', returning record to queue tail",
                        queue.name()
                    );
                    queue.requeue(record);
                }
                None
            }
        }
    }

    /// Run one forward pass and one reverse pass
    pub fn run_cycle(&self) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        let started = Instant::now();
        while self.dispatch_next(Pass::Forward).is_some() {
            outcome.forward += 1;
            if started.elapsed() >= self.starvation_timeout {
                outcome.timed_out = true;
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        outcome.reverse = self.dispatch_next(Pass::Reverse).is_some();
        outcome
    }

    /// Loop until shutdown is requested, then drain the pool and the queues
    pub fn run(self) {
        log::info!(
            "dispatcher started: {} queues, T_max {:?}, idle {:?}",
            self.buffers.queue_count(),
            self.starvation_timeout,
            self.idle_interval
        );

        while self.shutdown.is_running() {
            let outcome = self.run_cycle();
            if outcome.is_idle() {
                self.counters.idle_sleeps.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(self.idle_interval);
            }
        }

        log::info!("dispatcher stopping, draining worker pool");
        for record in self.pool.shutdown() {
            self.release(record);
        }
        for record in self.buffers.drain_all() {
            self.release(record);
        }

        let stats = self.counters.snapshot();
        log::info!(
            "dispatcher stopped: {} dispatched, {} released on shutdown",
            stats.total_dispatches(),
            stats.released_on_shutdown
        );
    }

    fn release(&self, record: WorkRecord) {
        self.counters
            .released_on_shutdown
            .fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.arena.release(record.into_slot()) {
            log::error!("releasing record at shutdown: {}", e);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queues", &self.buffers.queue_count())
            .field("starvation_timeout", &self.starvation_timeout)
            .field("idle_interval", &self.idle_interval)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
