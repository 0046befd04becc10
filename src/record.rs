// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Work records
//!
//! A [`WorkRecord`] is the unit moved through the priority buffer set: a
//! source or destination address plus a payload stored in an arena slot.
//! Whoever holds the record owns it; moving it into a queue or a job moves
//! the slot with it, and dropping it returns the slot to the arena.

use std::fmt;
use std::net::SocketAddr;

use crate::arena::{Arena, ArenaSlot};
use crate::error::{ArenaError, RecordError};

/// Where a record comes from or goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeAddress {
    /// Not yet assigned
    #[default]
    Unassigned,
    /// A beacon on the radio link, by its short link address
    Beacon(u16),
    /// A peer reached over IP
    Server(SocketAddr),
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAddress::Unassigned => write!(f, "unassigned"),
            NodeAddress::Beacon(id) => write!(f, "beacon:{:04x}", id),
            NodeAddress::Server(addr) => write!(f, "server:{}", addr),
        }
    }
}

/// A payload in flight between collaborators
pub struct WorkRecord {
    address: NodeAddress,
    slot: ArenaSlot,
    len: usize,
}

impl WorkRecord {
    /// Lease a slot from `arena` and wrap it in an empty record
    pub fn acquire(arena: &Arena, address: NodeAddress) -> Result<Self, ArenaError> {
        Ok(Self::from_slot(arena.acquire()?, address))
    }

    /// Wrap an already leased slot
    pub fn from_slot(slot: ArenaSlot, address: NodeAddress) -> Self {
        Self {
            address,
            slot,
            len: 0,
        }
    }

    /// Source or destination of this record
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Change the source or destination
    pub fn set_address(&mut self, address: NodeAddress) {
        self.address = address;
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.slot[..self.len]
    }

    /// Replace the payload with `bytes`
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), RecordError> {
        let max = self.slot.len();
        if bytes.len() > max {
            return Err(RecordError::Oversize {
                len: bytes.len(),
                max,
            });
        }
        self.slot[..bytes.len()].copy_from_slice(bytes);
        if bytes.len() < self.len {
            self.slot[bytes.len()..self.len].fill(0);
        }
        self.len = bytes.len();
        Ok(())
    }

    /// Whole slot for in-place decoding; commit the written length with [`Self::set_len`]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.slot
    }

    /// Declare how many bytes of the slot are valid payload
    pub fn set_len(&mut self, len: usize) -> Result<(), RecordError> {
        let max = self.slot.len();
        if len > max {
            return Err(RecordError::Oversize { len, max });
        }
        self.len = len;
        Ok(())
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest payload this record can hold
    pub fn capacity(&self) -> usize {
        self.slot.len()
    }

    /// Identifier of the arena backing this record
    pub fn arena_id(&self) -> u64 {
        self.slot.arena_id()
    }

    /// Give up the record and keep only its arena slot
    pub fn into_slot(self) -> ArenaSlot {
        self.slot
    }
}

impl fmt::Debug for WorkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRecord")
            .field("address", &self.address)
            .field("slot", &self.slot.index())
            .field("len", &self.len)
            .finish()
    }
}
