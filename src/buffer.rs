// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Priority buffer set
//!
//! A [`BufferSet`] is a fixed collection of named [`BufferQueue`]s, one per
//! message class. Each queue is a FIFO of [`WorkRecord`]s behind its own
//! lock, carries a static priority weight, and owns the [`RecordHandler`]
//! that processes its records.
//!
//! The queues are threaded once, at build time, onto the priority list in
//! descending weight order; equal weights keep registration order. The list
//! is never reordered afterwards.
//!
//! Lock order is always priority list, then one queue. Both are released
//! before anything touches the worker pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::list::{IndexQueue, LinkTable, NodeId};
use crate::record::WorkRecord;

/// Index of a queue in its [`BufferSet`], in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub usize);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Processing function of one buffer queue
///
/// Runs on a worker thread with the record it was handed. It either moves
/// the record downstream through `buffers`, or drops/releases it once the
/// terminal consumer is done with it.
pub trait RecordHandler: Send + Sync {
    /// Process one record
    fn process(&self, record: WorkRecord, buffers: &BufferSet);
}

impl<F> RecordHandler for F
where
    F: Fn(WorkRecord, &BufferSet) + Send + Sync,
{
    fn process(&self, record: WorkRecord, buffers: &BufferSet) {
        self(record, buffers)
    }
}

/// A record the buffer set would not take, handed back to the caller
#[derive(Error, Debug)]
#[error("{reason}")]
pub struct Refused {
    /// Why the record was refused
    pub reason: QueueError,
    /// The refused record, still owned by the caller
    pub record: WorkRecord,
}

impl From<Refused> for QueueError {
    fn from(refused: Refused) -> Self {
        refused.reason
    }
}

/// Counters of one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Queue id
    pub id: QueueId,
    /// Queue name
    pub name: String,
    /// Priority weight
    pub weight: u32,
    /// Records currently queued
    pub len: usize,
    /// Records accepted by [`BufferQueue::push_back`]
    pub enqueued: u64,
    /// Records removed by the dispatcher
    pub dispatched: u64,
    /// Records returned to the tail after a refused submission
    pub requeued: u64,
    /// Records refused because the queue was full
    pub refused: u64,
}

/// One priority-weighted FIFO of work records with its handler
pub struct BufferQueue {
    id: QueueId,
    name: String,
    weight: u32,
    capacity: Option<usize>,
    handler: Arc<dyn RecordHandler>,
    records: Mutex<IndexQueue<WorkRecord>>,
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    requeued: AtomicU64,
    refused: AtomicU64,
}

impl BufferQueue {
    fn new(id: QueueId, config: QueueConfig, handler: Arc<dyn RecordHandler>) -> Self {
        Self {
            id,
            name: config.name,
            weight: config.weight,
            capacity: config.capacity,
            handler,
            records: Mutex::new(IndexQueue::with_capacity(config.capacity.unwrap_or(16).min(1024))),
            enqueued: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Insert `record` at the tail, unless the queue is at capacity
    pub fn push_back(&self, record: WorkRecord) -> Result<(), Refused> {
        let mut records = self.records.lock();
        if let Some(capacity) = self.capacity {
            if records.len() >= capacity {
                drop(records);
                self.refused.fetch_add(1, Ordering::Relaxed);
                log::warn!("queue '{}' full, refusing record", self.name);
                return Err(Refused {
                    reason: QueueError::Full {
                        queue: self.name.clone(),
                        capacity,
                    },
                    record,
                });
            }
        }
        records.push_back(record);
        drop(records);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Put a record back at the tail, ignoring capacity
    pub(crate) fn requeue(&self, record: WorkRecord) {
        self.records.lock().push_back(record);
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the head record
    pub fn pop_front(&self) -> Option<WorkRecord> {
        self.records.lock().pop_front()
    }

    fn take_for_dispatch(&self) -> Option<WorkRecord> {
        let record = self.records.lock().pop_front()?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Remove every queued record, front to back
    pub fn drain(&self) -> Vec<WorkRecord> {
        let mut records = self.records.lock();
        let mut drained = Vec::with_capacity(records.len());
        while let Some(record) = records.pop_front() {
            drained.push(record);
        }
        drained
    }

    /// Queue id
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority weight
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Declared capacity, if bounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Handler processing this queue's records
    pub fn handler(&self) -> Arc<dyn RecordHandler> {
        Arc::clone(&self.handler)
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of this queue's counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            id: self.id,
            name: self.name.clone(),
            weight: self.weight,
            len: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("len", &self.len())
            .finish()
    }
}

/// Direction of a scan over the priority list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Highest weight first
    Forward,
    /// Lowest weight first
    Reverse,
}

struct PriorityList {
    table: LinkTable,
    head: NodeId,
    /// Queue threaded on each node, indexed by node id
    queue_of: Vec<Option<QueueId>>,
}

/// Registers queues before the buffer set is frozen
#[derive(Default)]
pub struct BufferSetBuilder {
    entries: Vec<(QueueConfig, Arc<dyn RecordHandler>)>,
}

impl BufferSetBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue. Ids follow registration order.
    pub fn register(
        &mut self,
        config: QueueConfig,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<QueueId, QueueError> {
        if self.entries.iter().any(|(c, _)| c.name == config.name) {
            return Err(QueueError::DuplicateQueue(config.name));
        }
        let id = QueueId(self.entries.len());
        self.entries.push((config, handler));
        Ok(id)
    }

    /// Convenience wrapper around [`Self::register`] for closures
    pub fn queue<H>(&mut self, name: &str, weight: u32, handler: H) -> Result<QueueId, QueueError>
    where
        H: RecordHandler + 'static,
    {
        self.register(QueueConfig::new(name, weight), Arc::new(handler))
    }

    /// Freeze the registrations and order the priority list
    pub fn build(self) -> BufferSet {
        let mut queues = Vec::with_capacity(self.entries.len());
        let mut by_name = HashMap::with_capacity(self.entries.len());
        for (index, (config, handler)) in self.entries.into_iter().enumerate() {
            let id = QueueId(index);
            by_name.insert(config.name.clone(), id);
            queues.push(BufferQueue::new(id, config, handler));
        }

        // Stable sort keeps registration order among equal weights.
        let mut order: Vec<QueueId> = queues.iter().map(|q| q.id).collect();
        order.sort_by(|a, b| queues[b.0].weight.cmp(&queues[a.0].weight));

        let mut table = LinkTable::with_capacity(queues.len() + 1);
        let head = table.add_node();
        let mut queue_of = vec![None];
        for id in order {
            let node = table.add_node();
            table.insert_back(node, head);
            queue_of.push(Some(id));
        }

        BufferSet {
            queues,
            by_name,
            priority: Mutex::new(PriorityList {
                table,
                head,
                queue_of,
            }),
        }
    }
}

/// Fixed collection of buffer queues ordered by priority weight
pub struct BufferSet {
    queues: Vec<BufferQueue>,
    by_name: HashMap<String, QueueId>,
    priority: Mutex<PriorityList>,
}

impl BufferSet {
    /// Start registering queues
    pub fn builder() -> BufferSetBuilder {
        BufferSetBuilder::new()
    }

    /// Queue by id
    pub fn queue(&self, id: QueueId) -> Option<&BufferQueue> {
        self.queues.get(id.0)
    }

    /// Queue by name
    pub fn queue_by_name(&self, name: &str) -> Option<&BufferQueue> {
        self.id_of(name).and_then(|id| self.queue(id))
    }

    /// Id registered under `name`
    pub fn id_of(&self, name: &str) -> Option<QueueId> {
        self.by_name.get(name).copied()
    }

    /// Insert `record` at the tail of queue `id`
    pub fn enqueue(&self, id: QueueId, record: WorkRecord) -> Result<(), Refused> {
        match self.queue(id) {
            Some(queue) => queue.push_back(record),
            None => Err(Refused {
                reason: QueueError::UnknownQueue(id),
                record,
            }),
        }
    }

    /// Insert `record` at the tail of the queue registered under `name`
    pub fn enqueue_by_name(&self, name: &str, record: WorkRecord) -> Result<(), Refused> {
        match self.id_of(name) {
            Some(id) => self.enqueue(id, record),
            None => Err(Refused {
                reason: QueueError::UnknownName(name.to_string()),
                record,
            }),
        }
    }

    /// Remove the head record of the first non-empty queue met while walking
    /// the priority list in `pass` direction
    pub fn pop_next(&self, pass: Pass) -> Option<(QueueId, WorkRecord)> {
        let list = self.priority.lock();
        let mut nodes = match pass {
            Pass::Forward => list.table.iter(list.head),
            Pass::Reverse => list.table.iter_rev(list.head),
        };
        nodes.find_map(|node| {
            let id = list.queue_of[node.0]?;
            let record = self.queues[id.0].take_for_dispatch()?;
            Some((id, record))
        })
    }

    /// Queue ids in priority-list order, highest weight first
    pub fn priority_order(&self) -> Vec<QueueId> {
        let list = self.priority.lock();
        list.table
            .iter(list.head)
            .filter_map(|node| list.queue_of[node.0])
            .collect()
    }

    /// All queues in registration order
    pub fn queues(&self) -> impl Iterator<Item = &BufferQueue> {
        self.queues.iter()
    }

    /// Number of registered queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Records queued across every queue
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Remove every queued record from every queue
    pub fn drain_all(&self) -> Vec<WorkRecord> {
        self.queues.iter().flat_map(|q| q.drain()).collect()
    }

    /// Counters of every queue, in registration order
    pub fn stats(&self) -> Vec<QueueStats> {
        self.queues.iter().map(|q| q.stats()).collect()
    }
}

impl fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSet")
            .field("queues", &self.queues)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::record::NodeAddress;

    fn noop() -> Arc<dyn RecordHandler> {
        Arc::new(|_record: WorkRecord, _set: &BufferSet| {})
    }

    fn record(arena: &Arena, tag: u8) -> WorkRecord {
        let mut record = WorkRecord::acquire(arena, NodeAddress::Beacon(tag as u16)).unwrap();
        record.set_payload(&[tag]).unwrap();
        record
    }

    fn weighted(weights: &[u32]) -> BufferSet {
        let mut builder = BufferSet::builder();
        for (i, &w) in weights.iter().enumerate() {
            builder
                .register(QueueConfig::new(format!("q{}", i), w), noop())
                .unwrap();
        }
        builder.build()
    }

    #[test]
    fn test_priority_order_by_weight() {
        let set = weighted(&[1, 10, 5]);
        assert_eq!(set.priority_order(), vec![QueueId(1), QueueId(2), QueueId(0)]);
    }

    #[test]
    fn test_equal_weights_keep_registration_order() {
        let set = weighted(&[5, 7, 5, 7, 5]);
        assert_eq!(
            set.priority_order(),
            vec![QueueId(1), QueueId(3), QueueId(0), QueueId(2), QueueId(4)]
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut builder = BufferSet::builder();
        builder.register(QueueConfig::new("a", 1), noop()).unwrap();
        let result = builder.register(QueueConfig::new("a", 2), noop());
        assert!(matches!(result, Err(QueueError::DuplicateQueue(_))));
    }

    #[test]
    fn test_fifo_within_queue() {
        let arena = Arena::new(8, 8, 1).unwrap();
        let set = weighted(&[1]);
        for tag in 0..5 {
            set.enqueue(QueueId(0), record(&arena, tag)).unwrap();
        }
        for tag in 0..5 {
            let (id, rec) = set.pop_next(Pass::Forward).unwrap();
            assert_eq!(id, QueueId(0));
            assert_eq!(rec.payload(), &[tag]);
        }
        assert!(set.pop_next(Pass::Forward).is_none());
    }

    #[test]
    fn test_forward_and_reverse_pass() {
        let arena = Arena::new(8, 8, 1).unwrap();
        let set = weighted(&[10, 5, 1]);
        for id in 0..3 {
            set.enqueue(QueueId(id), record(&arena, id as u8)).unwrap();
            set.enqueue(QueueId(id), record(&arena, id as u8)).unwrap();
        }

        assert_eq!(set.pop_next(Pass::Forward).unwrap().0, QueueId(0));
        assert_eq!(set.pop_next(Pass::Reverse).unwrap().0, QueueId(2));
        assert_eq!(set.pop_next(Pass::Reverse).unwrap().0, QueueId(2));
        assert_eq!(set.pop_next(Pass::Reverse).unwrap().0, QueueId(1));
        assert_eq!(set.pop_next(Pass::Forward).unwrap().0, QueueId(0));
        assert_eq!(set.total_len(), 1);
    }

    #[test]
    fn test_capacity_refuses_and_returns_record() {
        let arena = Arena::new(8, 4, 1).unwrap();
        let mut builder = BufferSet::builder();
        builder
            .register(QueueConfig::new("small", 1).with_capacity(1), noop())
            .unwrap();
        let set = builder.build();

        set.enqueue(QueueId(0), record(&arena, 1)).unwrap();
        let refused = set.enqueue(QueueId(0), record(&arena, 2)).unwrap_err();
        assert!(matches!(refused.reason, QueueError::Full { capacity: 1, .. }));
        assert_eq!(refused.record.payload(), &[2]);
        assert_eq!(set.queue(QueueId(0)).unwrap().stats().refused, 1);
    }

    #[test]
    fn test_unknown_queue() {
        let arena = Arena::new(8, 2, 1).unwrap();
        let set = weighted(&[1]);
        let refused = set.enqueue(QueueId(9), record(&arena, 0)).unwrap_err();
        assert!(matches!(refused.reason, QueueError::UnknownQueue(QueueId(9))));
        let refused = set.enqueue_by_name("nope", refused.record).unwrap_err();
        assert!(matches!(refused.reason, QueueError::UnknownName(_)));
    }

    #[test]
    fn test_requeue_goes_to_tail() {
        let arena = Arena::new(8, 4, 1).unwrap();
        let set = weighted(&[1]);
        let queue = set.queue(QueueId(0)).unwrap();
        queue.push_back(record(&arena, 1)).unwrap();
        queue.push_back(record(&arena, 2)).unwrap();

        let (_, first) = set.pop_next(Pass::Forward).unwrap();
        queue.requeue(first);
        assert_eq!(queue.pop_front().unwrap().payload(), &[2]);
        assert_eq!(queue.pop_front().unwrap().payload(), &[1]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.requeued, 1);
    }

    #[test]
    fn test_drain_all_returns_slots() {
        let arena = Arena::new(8, 4, 1).unwrap();
        let set = weighted(&[2, 1]);
        set.enqueue(QueueId(0), record(&arena, 0)).unwrap();
        set.enqueue(QueueId(1), record(&arena, 1)).unwrap();
        assert_eq!(arena.outstanding(), 2);

        let drained = set.drain_all();
        assert_eq!(drained.len(), 2);
        drop(drained);
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(set.total_len(), 0);
    }
}
