// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Index-linked circular lists
//!
//! [`LinkTable`] stores `next`/`prev` links for a set of nodes addressed by
//! [`NodeId`]. Any node can serve as the sentinel of a circular list; a list
//! is empty when its sentinel links to itself. Splicing, removal and
//! concatenation are O(1) and never allocate. The table carries no payload
//! and implies no ownership.
//!
//! [`IndexQueue`] builds a FIFO on top of a `LinkTable`, keeping the values
//! in a side table indexed by the same node ids.

use std::fmt;

/// Index of a node in a [`LinkTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Links {
    next: NodeId,
    prev: NodeId,
}

/// Link storage for any number of circular lists
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    links: Vec<Links>,
}

impl LinkTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Create a table with room for `capacity` nodes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            links: Vec::with_capacity(capacity),
        }
    }

    /// Add an isolated node (an empty list when used as a sentinel)
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.links.len());
        self.links.push(Links { next: id, prev: id });
        id
    }

    /// Number of nodes in the table
    pub fn node_count(&self) -> usize {
        self.links.len()
    }

    /// Reset `node` to a self-loop
    pub fn init(&mut self, node: NodeId) {
        self.links[node.0] = Links {
            next: node,
            prev: node,
        };
    }

    fn splice(&mut self, node: NodeId, prev: NodeId, next: NodeId) {
        self.links[next.0].prev = node;
        self.links[node.0] = Links { next, prev };
        self.links[prev.0].next = node;
    }

    /// Insert `node` right after `head`
    ///
    /// A node already linked into a list is moved, never shared.
    pub fn insert_front(&mut self, node: NodeId, head: NodeId) {
        self.remove(node);
        let next = self.links[head.0].next;
        self.splice(node, head, next);
    }

    /// Insert `node` right before `head` (at the tail of `head`'s list)
    ///
    /// A node already linked into a list is moved, never shared.
    pub fn insert_back(&mut self, node: NodeId, head: NodeId) {
        self.remove(node);
        let prev = self.links[head.0].prev;
        self.splice(node, prev, head);
    }

    /// Unlink `node` and leave it isolated. Removing an isolated node is a no-op.
    pub fn remove(&mut self, node: NodeId) {
        let Links { next, prev } = self.links[node.0];
        self.links[prev.0].next = next;
        self.links[next.0].prev = prev;
        self.init(node);
    }

    /// True when `node` links only to itself
    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.links[node.0].next == node
    }

    /// True when the list headed by `head` has no members
    pub fn is_empty(&self, head: NodeId) -> bool {
        self.is_isolated(head)
    }

    /// Count the members of `head`'s list. O(n), meant for diagnostics.
    pub fn len(&self, head: NodeId) -> usize {
        self.iter(head).count()
    }

    /// First member after the sentinel
    pub fn first(&self, head: NodeId) -> Option<NodeId> {
        let next = self.links[head.0].next;
        (next != head).then_some(next)
    }

    /// Last member before the sentinel
    pub fn last(&self, head: NodeId) -> Option<NodeId> {
        let prev = self.links[head.0].prev;
        (prev != head).then_some(prev)
    }

    /// Move every member of `other` to the tail of `head`'s list.
    ///
    /// `other` is left empty.
    pub fn concat(&mut self, head: NodeId, other: NodeId) {
        if head == other || self.is_empty(other) {
            return;
        }
        let first = self.links[other.0].next;
        let last = self.links[other.0].prev;
        let tail = self.links[head.0].prev;

        self.links[tail.0].next = first;
        self.links[first.0].prev = tail;
        self.links[last.0].next = head;
        self.links[head.0].prev = last;
        self.init(other);
    }

    /// Members of `head`'s list, front to back
    pub fn iter(&self, head: NodeId) -> Iter<'_> {
        Iter {
            table: self,
            head,
            cursor: head,
            reverse: false,
        }
    }

    /// Members of `head`'s list, back to front
    pub fn iter_rev(&self, head: NodeId) -> Iter<'_> {
        Iter {
            table: self,
            head,
            cursor: head,
            reverse: true,
        }
    }
}

/// Iterator over the members of one list
pub struct Iter<'a> {
    table: &'a LinkTable,
    head: NodeId,
    cursor: NodeId,
    reverse: bool,
}

impl Iterator for Iter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let links = self.table.links[self.cursor.0];
        let step = if self.reverse { links.prev } else { links.next };
        if step == self.head {
            return None;
        }
        self.cursor = step;
        Some(step)
    }
}

/// FIFO queue over a [`LinkTable`]
///
/// Node 0 is the sentinel. Released nodes are recycled through a free list
/// so steady-state pushes do not allocate.
pub struct IndexQueue<T> {
    table: LinkTable,
    head: NodeId,
    values: Vec<Option<T>>,
    free: LinkTable,
    free_head: NodeId,
    len: usize,
}

impl<T> IndexQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty queue with `capacity` preallocated nodes
    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = LinkTable::with_capacity(capacity + 1);
        let head = table.add_node();
        let mut free = LinkTable::with_capacity(capacity + 1);
        let free_head = free.add_node();
        let mut values = Vec::with_capacity(capacity + 1);
        values.push(None);

        let mut queue = Self {
            table,
            head,
            values,
            free,
            free_head,
            len: 0,
        };
        for _ in 0..capacity {
            let node = queue.grow();
            queue.free.insert_back(node, queue.free_head);
        }
        queue
    }

    fn grow(&mut self) -> NodeId {
        let node = self.table.add_node();
        let free_node = self.free.add_node();
        debug_assert_eq!(node, free_node);
        self.values.push(None);
        node
    }

    fn take_node(&mut self) -> NodeId {
        match self.free.first(self.free_head) {
            Some(node) => {
                self.free.remove(node);
                node
            }
            None => self.grow(),
        }
    }

    fn vacate(&mut self, node: NodeId) -> Option<T> {
        self.table.remove(node);
        let value = self.values[node.0].take();
        self.free.insert_front(node, self.free_head);
        self.len -= 1;
        value
    }

    /// Append `value` at the tail
    pub fn push_back(&mut self, value: T) -> NodeId {
        let node = self.take_node();
        self.values[node.0] = Some(value);
        self.table.insert_back(node, self.head);
        self.len += 1;
        node
    }

    /// Insert `value` at the head
    pub fn push_front(&mut self, value: T) -> NodeId {
        let node = self.take_node();
        self.values[node.0] = Some(value);
        self.table.insert_front(node, self.head);
        self.len += 1;
        node
    }

    /// Remove and return the head value
    pub fn pop_front(&mut self) -> Option<T> {
        let node = self.table.first(self.head)?;
        self.vacate(node)
    }

    /// Remove and return the tail value
    pub fn pop_back(&mut self) -> Option<T> {
        let node = self.table.last(self.head)?;
        self.vacate(node)
    }

    /// Remove the value stored at `node`, if it is still queued
    pub fn remove(&mut self, node: NodeId) -> Option<T> {
        if node == self.head || node.0 >= self.values.len() || self.values[node.0].is_none() {
            return None;
        }
        self.vacate(node)
    }

    /// Head value without removing it
    pub fn front(&self) -> Option<&T> {
        let node = self.table.first(self.head)?;
        self.values[node.0].as_ref()
    }

    /// Move every value of `other` to the tail of this queue, preserving order
    pub fn append(&mut self, other: &mut IndexQueue<T>) {
        while let Some(value) = other.pop_front() {
            self.push_back(value);
        }
    }

    /// Values front to back
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.table
            .iter(self.head)
            .filter_map(move |node| self.values[node.0].as_ref())
    }

    /// Number of queued values
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nodes allocated so far, queued or recycled
    pub fn allocated(&self) -> usize {
        self.values.len() - 1
    }
}

impl<T> Default for IndexQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for IndexQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
