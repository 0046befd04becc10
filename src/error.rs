// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Beacon Relay
//!
//! Every component reports its own error enum; [`RelayError`] wraps them
//! for callers that drive the whole core through [`crate::Relay`].

use thiserror::Error;

use crate::buffer::QueueId;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Arena allocator error
    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),

    /// Bounded packet channel error
    #[error("Packet channel error: {0}")]
    Packet(#[from] PacketError),

    /// Work record error
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Buffer queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Worker pool error
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the slab arena allocator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The backing memory request failed
    #[error("Allocation of {bytes} bytes failed")]
    AllocationError { bytes: usize },

    /// Free list empty and no expansion left
    #[error("Pool exhausted after {max_expansions} expansions")]
    PoolExhausted { max_expansions: usize },

    /// Slot was leased from another arena
    #[error("Slot belongs to arena {actual}, not arena {expected}")]
    ForeignSlot { expected: u64, actual: u64 },

    /// Invalid arena geometry
    #[error("Invalid arena configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the bounded packet channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Payload larger than the channel's record size
    #[error("Payload too large: {len} bytes exceeds maximum {max}")]
    Oversize { len: usize, max: usize },

    /// Every slot is occupied
    #[error("Channel full ({capacity} records)")]
    Full { capacity: usize },

    /// No record to dequeue
    #[error("Channel empty")]
    Empty,
}

/// Errors while populating a work record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Payload does not fit in the arena slot
    #[error("Payload too large: {len} bytes exceeds slot size {max}")]
    Oversize { len: usize, max: usize },
}

/// Errors from the priority buffer set
#[derive(Error, Debug)]
pub enum QueueError {
    /// No queue registered under this id
    #[error("Unknown queue: {0}")]
    UnknownQueue(QueueId),

    /// No queue registered under this name
    #[error("Unknown queue name: {0}")]
    UnknownName(String),

    /// A queue with this name is already registered
    #[error("Queue already registered: {0}")]
    DuplicateQueue(String),

    /// Queue reached its declared capacity
    #[error("Queue '{queue}' full ({capacity} records)")]
    Full { queue: String, capacity: usize },
}

/// Errors from the worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// A worker thread could not be spawned
    #[error("Failed to start worker {worker}: {reason}")]
    StartFailure { worker: usize, reason: String },

    /// Pool needs at least one thread
    #[error("Worker pool needs at least one thread")]
    NoWorkers,

    /// The dispatcher thread could not be spawned
    #[error("Failed to start dispatcher: {0}")]
    DispatcherStart(String),
}

/// Errors while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the configuration file failed
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`crate::RelayConfig`]
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration parsed but violates a constraint
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
