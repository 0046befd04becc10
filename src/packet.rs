// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded packet channel
//!
//! A [`PacketChannel`] is a fixed-capacity ring of transport records used at
//! the IP edge for raw inbound and outbound frames. Every slot is allocated
//! up front with room for `max_payload` bytes.
//!
//! Indices follow the classic circular-array convention: `front == rear == -1`
//! means empty, `(rear + 1) % capacity == front` means full. Operations never
//! block and never overwrite; callers that want to wait poll with a sleep
//! interval (see [`PacketChannel::dequeue_polling`]).

use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ChannelConfig;
use crate::error::PacketError;
use crate::shutdown::ShutdownFlag;

const EMPTY: isize = -1;

/// A transport frame copied out of a [`PacketChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    /// Peer address
    pub address: IpAddr,
    /// Peer port
    pub port: u16,
    /// Frame bytes
    pub content: Vec<u8>,
}

impl TransportRecord {
    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// True when the frame carries no bytes
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Preallocated storage for one record
struct PacketSlot {
    address: Option<IpAddr>,
    port: u16,
    content: Box<[u8]>,
    len: usize,
}

impl PacketSlot {
    fn new(max_payload: usize) -> Self {
        Self {
            address: None,
            port: 0,
            content: vec![0u8; max_payload].into_boxed_slice(),
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.address = None;
        self.port = 0;
        self.content[..self.len].fill(0);
        self.len = 0;
    }
}

struct Ring {
    slots: Vec<PacketSlot>,
    front: isize,
    rear: isize,
}

impl Ring {
    fn capacity(&self) -> isize {
        self.slots.len() as isize
    }

    fn is_empty(&self) -> bool {
        self.front == EMPTY && self.rear == EMPTY
    }

    fn is_full(&self) -> bool {
        !self.is_empty() && (self.rear + 1) % self.capacity() == self.front
    }

    fn len(&self) -> usize {
        let (front, rear, capacity) = (self.front, self.rear, self.capacity());
        let len = if front == EMPTY && rear == EMPTY {
            0
        } else if front == rear {
            1
        } else if rear > front {
            rear - front + 1
        } else {
            (capacity - front) + rear + 1
        };
        len as usize
    }
}

/// Fixed-capacity circular channel of transport records
pub struct PacketChannel {
    ring: Mutex<Ring>,
    capacity: usize,
    max_payload: usize,
}

impl PacketChannel {
    /// Create a channel holding up to `capacity` records of `max_payload` bytes
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize, max_payload: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| PacketSlot::new(max_payload)).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                front: EMPTY,
                rear: EMPTY,
            }),
            capacity,
            max_payload,
        }
    }

    /// Create a channel from its configuration section
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.capacity, config.max_payload)
    }

    /// Copy a frame into the slot after `rear`
    pub fn enqueue(&self, address: IpAddr, port: u16, content: &[u8]) -> Result<(), PacketError> {
        if content.len() > self.max_payload {
            return Err(PacketError::Oversize {
                len: content.len(),
                max: self.max_payload,
            });
        }

        let mut ring = self.ring.lock();
        if ring.is_full() {
            return Err(PacketError::Full {
                capacity: self.capacity,
            });
        }

        if ring.is_empty() {
            ring.front = 0;
            ring.rear = 0;
        } else {
            ring.rear = (ring.rear + 1) % ring.capacity();
        }

        let rear = ring.rear as usize;
        let slot = &mut ring.slots[rear];
        slot.address = Some(address);
        slot.port = port;
        slot.content[..content.len()].copy_from_slice(content);
        slot.len = content.len();
        Ok(())
    }

    /// Copy out and clear the slot at `front`
    pub fn dequeue(&self) -> Result<TransportRecord, PacketError> {
        let mut ring = self.ring.lock();
        if ring.is_empty() {
            return Err(PacketError::Empty);
        }

        let front = ring.front as usize;
        let slot = &mut ring.slots[front];
        let record = TransportRecord {
            address: slot.address.unwrap_or(IpAddr::from([0, 0, 0, 0])),
            port: slot.port,
            content: slot.content[..slot.len].to_vec(),
        };
        slot.clear();

        if ring.front == ring.rear {
            ring.front = EMPTY;
            ring.rear = EMPTY;
        } else {
            ring.front = (ring.front + 1) % ring.capacity();
        }
        Ok(record)
    }

    /// Retry [`Self::dequeue`] every `interval` until a record arrives or shutdown is requested
    pub fn dequeue_polling(
        &self,
        interval: Duration,
        shutdown: &ShutdownFlag,
    ) -> Option<TransportRecord> {
        while shutdown.is_running() {
            match self.dequeue() {
                Ok(record) => return Some(record),
                Err(_) => std::thread::sleep(interval),
            }
        }
        None
    }

    /// Retry [`Self::enqueue`] every `interval` while the channel is full.
    ///
    /// Oversize frames fail immediately. Returns [`PacketError::Full`] if
    /// shutdown is requested before a slot frees up.
    pub fn enqueue_polling(
        &self,
        address: IpAddr,
        port: u16,
        content: &[u8],
        interval: Duration,
        shutdown: &ShutdownFlag,
    ) -> Result<(), PacketError> {
        loop {
            match self.enqueue(address, port, content) {
                Err(PacketError::Full { .. }) if shutdown.is_running() => {
                    std::thread::sleep(interval)
                }
                other => return other,
            }
        }
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// True when no record is held
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// True when every slot is occupied
    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest frame accepted
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl std::fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("PacketChannel")
            .field("capacity", &self.capacity)
            .field("max_payload", &self.max_payload)
            .field("front", &ring.front)
            .field("rear", &ring.rear)
            .field("len", &ring.len())
            .finish()
    }
}
