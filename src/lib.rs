// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Beacon Relay
//!
//! Runtime core of a field gateway bridging low-power radio beacons and an
//! IP network. Work items flow through a fixed pipeline:
//!
//! ```text
//! UDP socket -> PacketChannel -> WorkRecord -> BufferSet -> Dispatcher -> WorkerPool -> handler
//! ```
//!
//! ## Key Features
//!
//! - **Arena Allocation**: Fixed-size work records recycled through a free list
//! - **Weighted Priority Queues**: Higher weights dispatched first
//! - **Bounded Starvation**: A reverse pass every iteration reaches the lowest queue
//! - **Worker Pool**: Fixed threads, graceful drain on shutdown
//! - **Bounded Packet Channels**: Preallocated rings at the IP edge
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use beacon_relay::{BufferSet, QueueConfig, Relay, RelayConfig, WorkRecord};
//! use beacon_relay::record::NodeAddress;
//!
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//!
//! let config = RelayConfig::default()
//!     .with_workers(2)
//!     .with_queues(vec![QueueConfig::new("uplink", 10)]);
//!
//! let relay = Relay::builder(config)
//!     .handler("uplink", move |_record: WorkRecord, _: &BufferSet| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .start()
//!     .unwrap();
//!
//! let record = relay.acquire_record(NodeAddress::Beacon(1)).unwrap();
//! relay.enqueue_by_name("uplink", record).unwrap();
//!
//! while seen.load(Ordering::SeqCst) == 0 {
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//!
//! relay.shutdown();
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! assert_eq!(relay.arena().outstanding(), 0);
//! ```
//!
//! ## Modules
//!
//! - [`arena`]: Fixed-size slot allocator
//! - [`list`]: Index-linked circular lists
//! - [`record`]: Work records leased from the arena
//! - [`packet`]: Bounded packet channel
//! - [`buffer`]: Priority buffer set
//! - [`dispatcher`]: Starvation-bounded dispatcher
//! - [`pool`]: Worker pool
//! - [`relay`]: Everything wired together

// Modules
pub mod arena;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod list;
pub mod packet;
pub mod pool;
pub mod record;
pub mod relay;
pub mod shutdown;

// Re-exports for convenient access
pub use arena::{Arena, ArenaSlot, ArenaStats};
pub use buffer::{
    BufferQueue, BufferSet, BufferSetBuilder, Pass, QueueId, QueueStats, RecordHandler, Refused,
};
pub use config::{ArenaConfig, ChannelConfig, QueueConfig, RelayConfig};
pub use dispatcher::{
    CycleOutcome, DispatchCounters, DispatchObserver, DispatchStats, Dispatcher,
};
pub use error::{
    ArenaError, ConfigError, PacketError, PoolError, QueueError, RecordError, RelayError, Result,
};
pub use list::{IndexQueue, LinkTable, NodeId};
pub use packet::{PacketChannel, TransportRecord};
pub use pool::{current_worker_id, Job, JobFn, Rejected, WorkerPool};
pub use record::{NodeAddress, WorkRecord};
pub use relay::{Relay, RelayBuilder, RelayStats};
pub use shutdown::ShutdownFlag;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
