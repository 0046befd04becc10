// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! High-level relay API
//!
//! [`Relay`] owns one instance of every runtime component: the arena, the
//! priority buffer set, the worker pool, the dispatcher thread, the shutdown
//! flag, and the inbound/outbound packet channels at the IP edge.
//!
//! # Example
//!
//! ```rust
//! use beacon_relay::{BufferSet, Relay, RelayConfig, WorkRecord};
//! use beacon_relay::record::NodeAddress;
//!
//! let config = RelayConfig::default();
//! let relay = Relay::builder(config)
//!     .handler("uplink", |record: WorkRecord, _: &BufferSet| drop(record))
//!     .handler("downlink", |record: WorkRecord, _: &BufferSet| drop(record))
//!     .handler("maintenance", |record: WorkRecord, _: &BufferSet| drop(record))
//!     .start()
//!     .unwrap();
//!
//! let mut record = relay.acquire_record(NodeAddress::Beacon(7)).unwrap();
//! record.set_payload(b"hello").unwrap();
//! relay.enqueue_by_name("uplink", record).unwrap();
//!
//! relay.shutdown();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaStats};
use crate::buffer::{BufferSet, Pass, QueueId, QueueStats, RecordHandler, Refused};
use crate::config::RelayConfig;
use crate::dispatcher::{DispatchCounters, DispatchObserver, DispatchStats, Dispatcher};
use crate::error::{ConfigError, PoolError, Result};
use crate::packet::PacketChannel;
use crate::pool::WorkerPool;
use crate::record::{NodeAddress, WorkRecord};
use crate::shutdown::ShutdownFlag;

/// Collects handlers before the relay starts
///
/// The packet channels and the shutdown flag exist from the moment the
/// builder is created, so handlers can capture them before the relay starts.
pub struct RelayBuilder {
    config: RelayConfig,
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
    observer: Option<DispatchObserver>,
    shutdown: ShutdownFlag,
    inbound: Arc<PacketChannel>,
    outbound: Arc<PacketChannel>,
}

impl RelayBuilder {
    /// Channel that will carry frames received from the network
    pub fn inbound(&self) -> Arc<PacketChannel> {
        Arc::clone(&self.inbound)
    }

    /// Channel that will carry frames waiting to be sent
    pub fn outbound(&self) -> Arc<PacketChannel> {
        Arc::clone(&self.outbound)
    }

    /// Flag the relay will stop on
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Attach the handler for the queue called `name`
    pub fn handler<H>(mut self, name: &str, handler: H) -> Self
    where
        H: RecordHandler + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Attach an already shared handler
    pub fn shared_handler(mut self, name: &str, handler: Arc<dyn RecordHandler>) -> Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    /// Observe every dispatch (queue and pass)
    pub fn on_dispatch<F>(mut self, observer: F) -> Self
    where
        F: Fn(QueueId, Pass) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Validate the configuration, build every component and spawn the
    /// dispatcher thread
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - A configured queue has no handler, or a handler names no queue
    /// - The arena cannot carve its first slab
    /// - A worker or the dispatcher thread cannot be spawned
    pub fn start(mut self) -> Result<Relay> {
        let config = self.config;
        config.validate()?;

        let arena = Arena::from_config(&config.arena)?;

        let mut builder = BufferSet::builder();
        for queue in &config.queues {
            let handler = self.handlers.remove(&queue.name).ok_or_else(|| {
                ConfigError::Invalid(format!("no handler for queue '{}'", queue.name))
            })?;
            builder.register(queue.clone(), handler)?;
        }
        if let Some(name) = self.handlers.keys().next() {
            return Err(ConfigError::Invalid(format!(
                "handler registered for unknown queue '{}'",
                name
            ))
            .into());
        }
        let buffers = Arc::new(builder.build());

        let pool = Arc::new(WorkerPool::new(config.workers)?);
        let shutdown = self.shutdown;

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&buffers),
            Arc::clone(&pool),
            arena.clone(),
            shutdown.clone(),
            config.starvation_timeout(),
            config.idle_interval(),
        );
        if let Some(observer) = self.observer {
            dispatcher = dispatcher.with_observer(observer);
        }
        let counters = dispatcher.counters();

        let handle = match std::thread::Builder::new()
            .name("relay-dispatcher".to_string())
            .spawn(move || dispatcher.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown();
                return Err(PoolError::DispatcherStart(e.to_string()).into());
            }
        };

        log::info!(
            "relay started: {} workers, {} queues, arena {}x{}",
            config.workers,
            buffers.queue_count(),
            config.arena.slot_count,
            config.arena.slot_size
        );

        Ok(Relay {
            inbound: self.inbound,
            outbound: self.outbound,
            config,
            arena,
            buffers,
            pool,
            shutdown,
            counters,
            dispatcher: Mutex::new(Some(handle)),
        })
    }
}

/// Snapshot of every component's counters
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Arena usage
    pub arena: ArenaStats,
    /// Per-queue counters, in registration order
    pub queues: Vec<QueueStats>,
    /// Dispatcher counters
    pub dispatch: DispatchStats,
    /// Worker threads alive
    pub workers_alive: usize,
    /// Worker threads running a job
    pub workers_working: usize,
    /// Jobs waiting in the pool
    pub jobs_queued: usize,
    /// Jobs executed by the pool
    pub jobs_executed: u64,
    /// Jobs that panicked
    pub jobs_panicked: u64,
    /// Records waiting in the inbound channel
    pub inbound_len: usize,
    /// Records waiting in the outbound channel
    pub outbound_len: usize,
}

/// Running gateway core
pub struct Relay {
    config: RelayConfig,
    arena: Arena,
    buffers: Arc<BufferSet>,
    pool: Arc<WorkerPool<WorkRecord>>,
    shutdown: ShutdownFlag,
    counters: Arc<DispatchCounters>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    inbound: Arc<PacketChannel>,
    outbound: Arc<PacketChannel>,
}

impl Relay {
    /// Start configuring a relay
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder {
            inbound: Arc::new(PacketChannel::from_config(&config.channel)),
            outbound: Arc::new(PacketChannel::from_config(&config.channel)),
            shutdown: ShutdownFlag::new(),
            config,
            handlers: HashMap::new(),
            observer: None,
        }
    }

    /// Lease a zeroed work record from the arena
    pub fn acquire_record(&self, address: NodeAddress) -> Result<WorkRecord> {
        Ok(WorkRecord::acquire(&self.arena, address)?)
    }

    /// Append a record to the queue `id`
    pub fn enqueue(&self, id: QueueId, record: WorkRecord) -> std::result::Result<(), Refused> {
        self.buffers.enqueue(id, record)
    }

    /// Append a record to the queue called `name`
    pub fn enqueue_by_name(
        &self,
        name: &str,
        record: WorkRecord,
    ) -> std::result::Result<(), Refused> {
        self.buffers.enqueue_by_name(name, record)
    }

    /// Return a record to the arena explicitly
    pub fn release(&self, record: WorkRecord) -> Result<()> {
        Ok(self.arena.release(record.into_slot())?)
    }

    /// Id of the queue called `name`
    pub fn queue_id(&self, name: &str) -> Option<QueueId> {
        self.buffers.id_of(name)
    }

    /// Configuration the relay was started with
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Arena backing every work record
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Priority buffer set
    pub fn buffers(&self) -> &Arc<BufferSet> {
        &self.buffers
    }

    /// Channel carrying frames received from the network
    pub fn inbound(&self) -> Arc<PacketChannel> {
        Arc::clone(&self.inbound)
    }

    /// Channel carrying frames waiting to be sent
    pub fn outbound(&self) -> Arc<PacketChannel> {
        Arc::clone(&self.outbound)
    }

    /// Flag shared by every loop of the relay
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// True until shutdown is requested
    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    /// Snapshot of every component's counters
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            arena: self.arena.stats(),
            queues: self.buffers.stats(),
            dispatch: self.counters.snapshot(),
            workers_alive: self.pool.alive_count(),
            workers_working: self.pool.working_count(),
            jobs_queued: self.pool.queued(),
            jobs_executed: self.pool.executed(),
            jobs_panicked: self.pool.panicked(),
            inbound_len: self.inbound.len(),
            outbound_len: self.outbound.len(),
        }
    }

    /// Stop the dispatcher, drain the worker pool and release every queued
    /// record. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.request();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("dispatcher thread terminated abnormally");
            }
        }

        // Records enqueued after the dispatcher exited.
        let late: Vec<WorkRecord> = self
            .pool
            .shutdown()
            .into_iter()
            .chain(self.buffers.drain_all())
            .collect();
        for record in late {
            if let Err(e) = self.arena.release(record.into_slot()) {
                log::error!("releasing record at shutdown: {}", e);
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("running", &self.is_running())
            .field("arena", &self.arena)
            .field("buffers", &self.buffers)
            .field("pool", &self.pool)
            .finish()
    }
}
