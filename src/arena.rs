// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Slab arena allocator
//!
//! The [`Arena`] hands out fixed-size, zeroed byte slots. Slots are carved
//! from slabs of `slot_count` slots each; unused slots sit on a free list
//! threaded through the slot table by index. The arena grows one slab at a
//! time until `max_expansions` slabs exist, and never shrinks.
//!
//! A slot is leased as an [`ArenaSlot`]. The lease owns the slot's bytes, so
//! two live leases can never alias the same slot. Returning a lease, either
//! through [`Arena::release`] or by dropping it, zeroes the bytes and pushes
//! the slot back on the free-list head.
//!
//! # Example
//!
//! ```rust
//! use beacon_relay::Arena;
//!
//! let arena = Arena::new(64, 4, 2).unwrap();
//! let mut slot = arena.acquire().unwrap();
//! slot[..5].copy_from_slice(b"hello");
//! assert_eq!(arena.outstanding(), 1);
//!
//! arena.release(slot).unwrap();
//! assert_eq!(arena.outstanding(), 0);
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ArenaConfig;
use crate::error::ArenaError;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// One entry of the slot table
enum Entry {
    /// On the free list; `next` is the following free slot
    Free { next: Option<usize>, bytes: Box<[u8]> },
    /// Leased to exactly one [`ArenaSlot`]
    Leased,
}

struct ArenaState {
    entries: Vec<Entry>,
    free_head: Option<usize>,
    outstanding: usize,
    expansions: usize,
}

struct Shared {
    id: u64,
    slot_size: usize,
    slot_count: usize,
    max_expansions: usize,
    state: Mutex<ArenaState>,
}

impl Shared {
    /// Carve one more slab and thread its slots onto the free list.
    ///
    /// Must be called with the state lock held.
    fn expand(&self, state: &mut ArenaState) -> Result<(), ArenaError> {
        if state.expansions >= self.max_expansions {
            return Err(ArenaError::PoolExhausted {
                max_expansions: self.max_expansions,
            });
        }

        state
            .entries
            .try_reserve_exact(self.slot_count)
            .map_err(|_| ArenaError::AllocationError {
                bytes: self.slot_count * std::mem::size_of::<Entry>(),
            })?;

        let slab = (0..self.slot_count)
            .map(|_| zeroed_bytes(self.slot_size))
            .collect::<Result<Vec<_>, _>>()?;

        let base = state.entries.len();
        for (i, bytes) in slab.into_iter().enumerate() {
            let next = if i + 1 < self.slot_count {
                Some(base + i + 1)
            } else {
                state.free_head
            };
            state.entries.push(Entry::Free { next, bytes });
        }
        state.free_head = Some(base);
        state.expansions += 1;

        log::debug!(
            "arena {}: slab {}/{} carved, capacity now {} slots",
            self.id,
            state.expansions,
            self.max_expansions,
            state.entries.len()
        );
        Ok(())
    }

    fn put_back(&self, index: usize, mut bytes: Box<[u8]>) {
        bytes.fill(0);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let next = state.free_head;
        if let Some(entry) = state.entries.get_mut(index) {
            debug_assert!(matches!(entry, Entry::Leased));
            *entry = Entry::Free { next, bytes };
            state.free_head = Some(index);
            state.outstanding -= 1;
        }
    }
}

fn zeroed_bytes(len: usize) -> Result<Box<[u8]>, ArenaError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ArenaError::AllocationError { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf.into_boxed_slice())
}

/// Point-in-time view of an arena
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArenaStats {
    /// Bytes per slot
    pub slot_size: usize,
    /// Total slots carved so far
    pub capacity: usize,
    /// Slots currently leased
    pub outstanding: usize,
    /// Slabs carved so far, the initial one included
    pub expansions: usize,
    /// Maximum number of slabs
    pub max_expansions: usize,
}

impl ArenaStats {
    /// Fraction of carved slots currently leased
    pub fn usage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.outstanding as f64 / self.capacity as f64
    }
}

/// Fixed-size slot allocator with free-list recycling
///
/// Cloning an `Arena` yields another handle to the same slots.
#[derive(Clone)]
pub struct Arena {
    shared: Arc<Shared>,
}

impl Arena {
    /// Create an arena and carve its first slab.
    ///
    /// `max_expansions` counts slabs, the first one included, so the arena
    /// never holds more than `slot_count * max_expansions` slots.
    pub fn new(
        slot_size: usize,
        slot_count: usize,
        max_expansions: usize,
    ) -> Result<Self, ArenaError> {
        if slot_size == 0 || slot_count == 0 {
            return Err(ArenaError::InvalidConfig(format!(
                "slot_size ({}) and slot_count ({}) must be non-zero",
                slot_size, slot_count
            )));
        }
        if max_expansions == 0 {
            return Err(ArenaError::InvalidConfig(
                "max_expansions must be at least 1".to_string(),
            ));
        }

        let shared = Shared {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            slot_size,
            slot_count,
            max_expansions,
            state: Mutex::new(ArenaState {
                entries: Vec::new(),
                free_head: None,
                outstanding: 0,
                expansions: 0,
            }),
        };

        {
            let mut state = shared.state.lock();
            shared.expand(&mut state)?;
        }

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Create an arena from its configuration section
    pub fn from_config(config: &ArenaConfig) -> Result<Self, ArenaError> {
        Self::new(config.slot_size, config.slot_count, config.max_expansions)
    }

    /// Lease a zeroed slot, growing the arena by one slab if the free list is empty
    pub fn acquire(&self) -> Result<ArenaSlot, ArenaError> {
        let mut state = self.shared.state.lock();

        if state.free_head.is_none() {
            self.shared.expand(&mut state)?;
        }

        let index = match state.free_head {
            Some(index) => index,
            None => {
                return Err(ArenaError::PoolExhausted {
                    max_expansions: self.shared.max_expansions,
                })
            }
        };

        match std::mem::replace(&mut state.entries[index], Entry::Leased) {
            Entry::Free { next, bytes } => {
                state.free_head = next;
                state.outstanding += 1;
                Ok(ArenaSlot {
                    arena: Arc::clone(&self.shared),
                    index,
                    bytes: Some(bytes),
                })
            }
            Entry::Leased => {
                // The free list only ever links free entries.
                unreachable!("arena {}: free list points at leased slot {}", self.shared.id, index)
            }
        }
    }

    /// Return a slot to this arena.
    ///
    /// A slot leased from a different arena is refused with
    /// [`ArenaError::ForeignSlot`]; it still goes home to its own arena.
    pub fn release(&self, mut slot: ArenaSlot) -> Result<(), ArenaError> {
        if slot.arena.id != self.shared.id {
            return Err(ArenaError::ForeignSlot {
                expected: self.shared.id,
                actual: slot.arena.id,
            });
        }
        if let Some(bytes) = slot.bytes.take() {
            self.shared.put_back(slot.index, bytes);
        }
        Ok(())
    }

    /// Unique identifier of this arena
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Bytes per slot
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    /// Slots carved per slab
    pub fn slot_count(&self) -> usize {
        self.shared.slot_count
    }

    /// Total slots carved so far
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Slots currently leased
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    /// Slabs carved so far, the initial one included
    pub fn expansions(&self) -> usize {
        self.shared.state.lock().expansions
    }

    /// Fraction of carved slots currently leased
    pub fn usage(&self) -> f64 {
        self.stats().usage()
    }

    /// Snapshot of the arena counters taken under one lock
    pub fn stats(&self) -> ArenaStats {
        let state = self.shared.state.lock();
        ArenaStats {
            slot_size: self.shared.slot_size,
            capacity: state.entries.len(),
            outstanding: state.outstanding,
            expansions: state.expansions,
            max_expansions: self.shared.max_expansions,
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Arena")
            .field("id", &self.shared.id)
            .field("slot_size", &stats.slot_size)
            .field("capacity", &stats.capacity)
            .field("outstanding", &stats.outstanding)
            .field("expansions", &stats.expansions)
            .finish()
    }
}

/// Exclusive lease on one arena slot
///
/// Dereferences to the slot's bytes. Dropping the lease returns the slot to
/// the arena it came from.
pub struct ArenaSlot {
    arena: Arc<Shared>,
    index: usize,
    bytes: Option<Box<[u8]>>,
}

impl ArenaSlot {
    /// Index of this slot in its arena's slot table
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the arena this slot belongs to
    pub fn arena_id(&self) -> u64 {
        self.arena.id
    }
}

impl Deref for ArenaSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }
}

impl DerefMut for ArenaSlot {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for ArenaSlot {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.arena.put_back(self.index, bytes);
        }
    }
}

impl fmt::Debug for ArenaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaSlot")
            .field("arena", &self.arena.id)
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_arena_new() {
        let arena = Arena::new(64, 4, 2).unwrap();
        assert_eq!(arena.slot_size(), 64);
        assert_eq!(arena.capacity(), 4);
        assert_eq!(arena.expansions(), 1);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn test_arena_invalid_geometry() {
        assert!(matches!(
            Arena::new(0, 4, 1),
            Err(ArenaError::InvalidConfig(_))
        ));
        assert!(matches!(
            Arena::new(64, 0, 1),
            Err(ArenaError::InvalidConfig(_))
        ));
        assert!(matches!(
            Arena::new(64, 4, 0),
            Err(ArenaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_acquire_returns_zeroed_slot() {
        let arena = Arena::new(16, 1, 1).unwrap();
        let mut slot = arena.acquire().unwrap();
        assert_eq!(slot.len(), 16);
        slot.fill(0xAB);
        arena.release(slot).unwrap();

        let slot = arena.acquire().unwrap();
        assert!(slot.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion_after_max_expansions() {
        let arena = Arena::new(64, 4, 2).unwrap();
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(arena.acquire().unwrap());
        }
        assert_eq!(arena.expansions(), 2);
        assert_eq!(
            arena.acquire().unwrap_err(),
            ArenaError::PoolExhausted { max_expansions: 2 }
        );
        assert_eq!(arena.outstanding(), 8);
    }

    #[test]
    fn test_release_reuses_free_list_head() {
        let arena = Arena::new(8, 4, 1).unwrap();
        let a = arena.acquire().unwrap();
        let b = arena.acquire().unwrap();
        let b_index = b.index();
        arena.release(b).unwrap();

        let c = arena.acquire().unwrap();
        assert_eq!(c.index(), b_index);
        drop(a);
        drop(c);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn test_no_aliasing_between_live_slots() {
        let arena = Arena::new(8, 3, 3).unwrap();
        let slots: Vec<_> = (0..9).map(|_| arena.acquire().unwrap()).collect();
        let indices: HashSet<_> = slots.iter().map(|s| s.index()).collect();
        assert_eq!(indices.len(), 9);
    }

    #[test]
    fn test_drop_returns_slot() {
        let arena = Arena::new(8, 2, 1).unwrap();
        {
            let _slot = arena.acquire().unwrap();
            assert_eq!(arena.outstanding(), 1);
        }
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn test_release_foreign_slot() {
        let first = Arena::new(8, 2, 1).unwrap();
        let second = Arena::new(8, 2, 1).unwrap();
        let slot = first.acquire().unwrap();

        let err = second.release(slot).unwrap_err();
        assert!(matches!(err, ArenaError::ForeignSlot { .. }));
        // The rejected lease still went home.
        assert_eq!(first.outstanding(), 0);
        assert_eq!(second.outstanding(), 0);
    }

    #[test]
    fn test_usage() {
        let arena = Arena::new(8, 4, 1).unwrap();
        assert_eq!(arena.usage(), 0.0);
        let a = arena.acquire().unwrap();
        let _b = arena.acquire().unwrap();
        assert!((arena.usage() - 0.5).abs() < f64::EPSILON);
        arena.release(a).unwrap();
        assert!((arena.usage() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_never_shrinks() {
        let arena = Arena::new(8, 2, 3).unwrap();
        let held: Vec<_> = (0..5).map(|_| arena.acquire().unwrap()).collect();
        assert_eq!(arena.capacity(), 6);
        drop(held);
        assert_eq!(arena.capacity(), 6);
        assert_eq!(arena.stats().expansions, 3);
    }

    #[test]
    fn test_failed_expansion_leaves_table_untouched() {
        let mut shared = Shared {
            id: 0,
            slot_size: 8,
            slot_count: 3,
            max_expansions: 3,
            state: Mutex::new(ArenaState {
                entries: Vec::new(),
                free_head: None,
                outstanding: 0,
                expansions: 0,
            }),
        };
        {
            let mut state = shared.state.lock();
            shared.expand(&mut state).unwrap();
        }

        // Larger than any allocation can be.
        shared.slot_size = isize::MAX as usize + 1;
        let mut state = shared.state.lock();
        let result = shared.expand(&mut state);
        assert!(matches!(result, Err(ArenaError::AllocationError { .. })));
        assert_eq!(state.entries.len(), 3);
        assert_eq!(state.expansions, 1);
        assert_eq!(state.free_head, Some(0));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let arena = Arena::new(32, 8, 4).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let mut slot = arena.acquire().unwrap();
                        slot[0] = t as u8;
                        slot[1] = i as u8;
                        assert_eq!(slot[0], t as u8);
                        arena.release(slot).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arena.outstanding(), 0);
    }
}
