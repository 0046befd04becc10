// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Beacon Relay
//!
//! Start-up parameters are read once, validated, and handed to
//! [`crate::Relay::builder`]. Every field has a default, so a JSON file only
//! needs to name what it changes:
//!
//! ```json
//! {
//!   "workers": 8,
//!   "arena": { "slot_size": 512 },
//!   "channel": { "max_payload": 512 },
//!   "queues": [
//!     { "name": "uplink", "weight": 10 },
//!     { "name": "downlink", "weight": 5, "capacity": 256 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Arena allocator geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Bytes per slot
    pub slot_size: usize,
    /// Slots per slab
    pub slot_count: usize,
    /// Maximum number of slabs, the initial one included
    pub max_expansions: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            slot_size: 256,
            slot_count: 64,
            max_expansions: 4,
        }
    }
}

/// Bounded packet channel geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Records per channel
    pub capacity: usize,
    /// Largest frame accepted, in bytes
    pub max_payload: usize,
    /// Sleep between polls when a channel is empty or full
    pub poll_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_payload: 256,
            poll_interval_ms: 10,
        }
    }
}

impl ChannelConfig {
    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One buffer queue of the priority buffer set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, unique within the set
    pub name: String,
    /// Priority weight; higher runs first
    pub weight: u32,
    /// Maximum queued records (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl QueueConfig {
    /// Create an unbounded queue entry
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            capacity: None,
        }
    }

    /// Limit the queue to `capacity` records
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Start-up configuration of the whole core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Arena allocator backing every work record
    pub arena: ArenaConfig,
    /// Worker threads in the pool
    pub workers: usize,
    /// Longest forward pass before the reverse pass runs (T_max)
    pub starvation_timeout_ms: u64,
    /// Dispatcher sleep when no queue has work
    pub idle_interval_ms: u64,
    /// Bounded packet channels at the IP edge
    pub channel: ChannelConfig,
    /// Buffer queues, in registration order
    pub queues: Vec<QueueConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            arena: ArenaConfig::default(),
            workers: 4,
            starvation_timeout_ms: 50,
            idle_interval_ms: 5,
            channel: ChannelConfig::default(),
            queues: vec![
                QueueConfig::new("uplink", 10),
                QueueConfig::new("downlink", 5),
                QueueConfig::new("maintenance", 1),
            ],
        }
    }
}

impl RelayConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every constraint the core relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let arena = &self.arena;
        if arena.slot_size == 0 || arena.slot_count == 0 {
            return Err(ConfigError::Invalid(
                "arena.slot_size and arena.slot_count must be non-zero".to_string(),
            ));
        }
        if arena.max_expansions == 0 {
            return Err(ConfigError::Invalid(
                "arena.max_expansions must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.channel.capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel.capacity must be non-zero".to_string(),
            ));
        }
        if self.channel.max_payload > arena.slot_size {
            return Err(ConfigError::Invalid(format!(
                "channel.max_payload ({}) exceeds arena.slot_size ({})",
                self.channel.max_payload, arena.slot_size
            )));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one queue is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(ConfigError::Invalid("queue name is empty".to_string()));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate queue name '{}'",
                    queue.name
                )));
            }
            if queue.capacity == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "queue '{}' has zero capacity",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    /// Override the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override the arena geometry
    pub fn with_arena(mut self, slot_size: usize, slot_count: usize, max_expansions: usize) -> Self {
        self.arena = ArenaConfig {
            slot_size,
            slot_count,
            max_expansions,
        };
        self
    }

    /// Replace the queue list
    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }

    /// Append one queue
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    /// Override the starvation timeout
    pub fn with_starvation_timeout(mut self, timeout: Duration) -> Self {
        self.starvation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Starvation timeout (T_max) as a [`Duration`]
    pub fn starvation_timeout(&self) -> Duration {
        Duration::from_millis(self.starvation_timeout_ms)
    }

    /// Idle sleep as a [`Duration`]
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}
