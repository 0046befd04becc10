//! Integration tests for the Beacon Relay core
//!
//! These cover the guarantees the components make to each other: dispatch
//! order, the starvation bound, exactly-once execution, arena accounting and
//! channel round-trips.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_relay::*;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn ignore() -> Arc<dyn RecordHandler> {
    Arc::new(|_record: WorkRecord, _buffers: &BufferSet| {})
}

// ============================================================================
// Dispatch order
// ============================================================================

#[test]
fn test_weights_dispatched_highest_first() {
    let mut builder = BufferSet::builder();
    builder.register(QueueConfig::new("low", 1), ignore()).unwrap();
    builder.register(QueueConfig::new("high", 10), ignore()).unwrap();
    builder.register(QueueConfig::new("mid", 5), ignore()).unwrap();
    let buffers = Arc::new(builder.build());

    let arena = Arena::new(64, 8, 1).unwrap();
    for name in ["low", "high", "mid"] {
        let record = WorkRecord::acquire(&arena, NodeAddress::Unassigned).unwrap();
        buffers.enqueue_by_name(name, record).unwrap();
    }

    let pool = Arc::new(WorkerPool::new(2).unwrap());
    let order = Arc::new(Mutex::new(Vec::new()));
    let observer: DispatchObserver = {
        let order = Arc::clone(&order);
        let buffers = Arc::clone(&buffers);
        Arc::new(move |id, _pass| {
            if let Some(queue) = buffers.queue(id) {
                order.lock().push(queue.weight());
            }
        })
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&buffers),
        Arc::clone(&pool),
        arena.clone(),
        ShutdownFlag::new(),
        Duration::from_secs(1),
        Duration::from_millis(1),
    )
    .with_observer(observer);

    let outcome = dispatcher.run_cycle();
    assert_eq!(outcome.forward, 3);
    assert!(!outcome.timed_out);
    assert_eq!(*order.lock(), vec![10, 5, 1]);

    pool.shutdown();
    assert_eq!(arena.outstanding(), 0);
}

#[test]
fn test_equal_weights_keep_registration_order() {
    let mut builder = BufferSet::builder();
    for name in ["a", "b", "c"] {
        builder.register(QueueConfig::new(name, 3), ignore()).unwrap();
    }
    let buffers = builder.build();
    let arena = Arena::new(16, 4, 1).unwrap();
    for name in ["c", "b", "a"] {
        let record = WorkRecord::acquire(&arena, NodeAddress::Unassigned).unwrap();
        buffers.enqueue_by_name(name, record).unwrap();
    }

    let forward: Vec<_> = std::iter::from_fn(|| buffers.pop_next(Pass::Forward))
        .map(|(id, _)| buffers.queue(id).map(|q| q.name().to_string()))
        .collect();
    assert_eq!(
        forward,
        vec![Some("a".into()), Some("b".into()), Some("c".into())]
    );
}

// ============================================================================
// Starvation bound
// ============================================================================

#[test]
fn test_low_priority_dispatched_under_sustained_load() {
    let t_max = Duration::from_millis(20);
    let low_seen = Arc::new(Mutex::new(None::<Instant>));

    let mut builder = BufferSet::builder();
    // The high queue never empties: its handler puts every record back.
    let recycle: Arc<dyn RecordHandler> = Arc::new(|record: WorkRecord, buffers: &BufferSet| {
        let _ = buffers.enqueue_by_name("high", record);
    });
    builder.register(QueueConfig::new("high", 100), recycle).unwrap();
    let mark: Arc<dyn RecordHandler> = {
        let low_seen = Arc::clone(&low_seen);
        Arc::new(move |_record: WorkRecord, _: &BufferSet| {
            low_seen.lock().get_or_insert_with(Instant::now);
        })
    };
    builder.register(QueueConfig::new("low", 1), mark).unwrap();
    let buffers = Arc::new(builder.build());

    let arena = Arena::new(32, 128, 1).unwrap();
    for i in 0..100u16 {
        let record = WorkRecord::acquire(&arena, NodeAddress::Beacon(i)).unwrap();
        buffers.enqueue_by_name("high", record).unwrap();
    }

    let pool = Arc::new(WorkerPool::new(2).unwrap());
    let shutdown = ShutdownFlag::new();
    let dispatcher = Dispatcher::new(
        Arc::clone(&buffers),
        Arc::clone(&pool),
        arena.clone(),
        shutdown.clone(),
        t_max,
        Duration::from_millis(1),
    );
    let counters = dispatcher.counters();
    let handle = std::thread::spawn(move || dispatcher.run());

    // Let the high queue saturate the dispatcher first.
    std::thread::sleep(Duration::from_millis(5));
    let submitted = Instant::now();
    let record = WorkRecord::acquire(&arena, NodeAddress::Beacon(999)).unwrap();
    buffers.enqueue_by_name("low", record).unwrap();

    let deadline = submitted + Duration::from_secs(5);
    while low_seen.lock().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    shutdown.request();
    handle.join().unwrap();

    let seen = low_seen.lock().expect("low-priority record never dispatched");
    let latency = seen.duration_since(submitted);
    // One forward window plus one reverse pass, with scheduling slack.
    assert!(
        latency < t_max + Duration::from_millis(500),
        "low-priority latency {:?}",
        latency
    );
    assert!(counters.snapshot().reverse_dispatches >= 1);
    assert_eq!(arena.outstanding(), 0);
}

// ============================================================================
// Worker pool
// ============================================================================

#[test]
fn test_every_job_runs_exactly_once() {
    const JOBS: usize = 2_000;
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..JOBS).map(|_| AtomicUsize::new(0)).collect());

    let pool: WorkerPool<usize> = WorkerPool::new(4).unwrap();
    let job: JobFn<usize> = {
        let runs = Arc::clone(&runs);
        Arc::new(move |i| {
            runs[i].fetch_add(1, Ordering::SeqCst);
        })
    };
    for i in 0..JOBS {
        pool.submit(Arc::clone(&job), i, 1).unwrap();
    }

    let leftover = pool.shutdown();
    assert!(leftover.is_empty());
    assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    assert_eq!(pool.executed(), JOBS as u64);

    // Nothing runs after shutdown returns.
    assert!(pool.submit(job, 0, 1).is_err());
    assert_eq!(runs[0].load(Ordering::SeqCst), 1);
}

#[test]
fn test_single_worker_is_fifo() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pool: WorkerPool<u32> = WorkerPool::new(1).unwrap();
    let job: JobFn<u32> = {
        let seen = Arc::clone(&seen);
        Arc::new(move |n| seen.lock().push(n))
    };
    // Priorities are carried, not re-sorted.
    for (n, priority) in [(1, 1), (2, 9), (3, 5)] {
        pool.submit(Arc::clone(&job), n, priority).unwrap();
    }
    pool.shutdown();
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
}

// ============================================================================
// Arena allocator
// ============================================================================

#[test]
fn test_arena_exhaustion_after_max_expansions() {
    let arena = Arena::new(64, 4, 2).unwrap();
    let held: Vec<_> = (0..8).map(|_| arena.acquire().unwrap()).collect();
    assert_eq!(arena.expansions(), 2);
    assert_eq!(arena.capacity(), 8);

    assert_eq!(
        arena.acquire().unwrap_err(),
        ArenaError::PoolExhausted { max_expansions: 2 }
    );

    drop(held);
    assert_eq!(arena.outstanding(), 0);
    assert!(arena.acquire().is_ok());
}

#[test]
fn test_random_acquire_release_never_aliases() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let arena = Arena::new(32, 8, 4).unwrap();
    let mut held: Vec<ArenaSlot> = Vec::new();

    for _ in 0..5_000 {
        if rng.gen_bool(0.55) {
            match arena.acquire() {
                Ok(mut slot) => {
                    assert!(slot.iter().all(|&b| b == 0), "slot not zeroed");
                    slot[0] = 0xff;
                    held.push(slot);
                }
                Err(e) => {
                    assert_eq!(e, ArenaError::PoolExhausted { max_expansions: 4 });
                    assert_eq!(held.len(), arena.capacity());
                }
            }
        } else if !held.is_empty() {
            let slot = held.swap_remove(rng.gen_range(0..held.len()));
            arena.release(slot).unwrap();
        }

        assert_eq!(arena.outstanding(), held.len());
        assert!(arena.outstanding() <= arena.slot_count() * arena.expansions());
        let distinct: HashSet<usize> = held.iter().map(|s| s.index()).collect();
        assert_eq!(distinct.len(), held.len());
    }
}

#[test]
fn test_foreign_slot_rejected() {
    let a = Arena::new(16, 2, 1).unwrap();
    let b = Arena::new(16, 2, 1).unwrap();
    let slot = b.acquire().unwrap();
    assert!(matches!(a.release(slot), Err(ArenaError::ForeignSlot { .. })));
    assert_eq!(b.outstanding(), 0);
}

// ============================================================================
// Buffer queues
// ============================================================================

#[test]
fn test_queue_fifo_law() {
    let mut builder = BufferSet::builder();
    let id = builder.register(QueueConfig::new("q", 1), ignore()).unwrap();
    let buffers = builder.build();
    let arena = Arena::new(16, 64, 1).unwrap();

    for i in 0..50u16 {
        let record = WorkRecord::acquire(&arena, NodeAddress::Beacon(i)).unwrap();
        buffers.enqueue(id, record).unwrap();
    }
    let queue = buffers.queue(id).unwrap();
    for i in 0..50u16 {
        let record = queue.pop_front().unwrap();
        assert_eq!(record.address(), NodeAddress::Beacon(i));
    }
    assert!(queue.pop_front().is_none());
}

// ============================================================================
// Bounded packet channel
// ============================================================================

#[test]
fn test_channel_round_trip_and_length() {
    let channel = PacketChannel::new(4, 32);
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    channel.enqueue(addr, 1700, b"one").unwrap();
    channel.enqueue(addr, 1701, b"two").unwrap();
    channel.enqueue(addr, 1702, b"three").unwrap();
    assert_eq!(channel.len(), 3);

    let first = channel.dequeue().unwrap();
    assert_eq!(first.address, addr);
    assert_eq!(first.port, 1700);
    assert_eq!(first.content, b"one");
    assert_eq!(channel.len(), 2);

    channel.enqueue(addr, 1703, b"four").unwrap();
    channel.enqueue(addr, 1704, b"five").unwrap();
    assert!(channel.is_full());
    assert_eq!(
        channel.enqueue(addr, 1705, b"six"),
        Err(PacketError::Full { capacity: 4 })
    );
    assert_eq!(channel.len(), 4);

    let ports: Vec<u16> = std::iter::from_fn(|| channel.dequeue().ok())
        .map(|r| r.port)
        .collect();
    assert_eq!(ports, vec![1701, 1702, 1703, 1704]);
    assert_eq!(channel.dequeue(), Err(PacketError::Empty));
}

#[test]
fn test_channel_polling_unblocks_on_shutdown() {
    let channel = Arc::new(PacketChannel::new(1, 8));
    let shutdown = ShutdownFlag::new();

    let consumer = {
        let channel = Arc::clone(&channel);
        let shutdown = shutdown.clone();
        std::thread::spawn(move || channel.dequeue_polling(Duration::from_millis(1), &shutdown))
    };
    std::thread::sleep(Duration::from_millis(10));
    shutdown.request();
    assert_eq!(consumer.join().unwrap(), None);
}

// ============================================================================
// Relay end to end
// ============================================================================

#[test]
fn test_relay_handles_every_record() {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = |handled: &Arc<AtomicUsize>| {
        let handled = Arc::clone(handled);
        move |_record: WorkRecord, _: &BufferSet| {
            handled.fetch_add(1, Ordering::SeqCst);
        }
    };

    let mut config = RelayConfig::default()
        .with_workers(3)
        .with_arena(64, 16, 4)
        .with_queues(vec![
            QueueConfig::new("uplink", 10),
            QueueConfig::new("downlink", 5),
            QueueConfig::new("maintenance", 1),
        ]);
    config.channel.max_payload = 64;

    let relay = Relay::builder(config)
        .handler("uplink", counter(&handled))
        .handler("downlink", counter(&handled))
        .handler("maintenance", counter(&handled))
        .start()
        .unwrap();

    let names = ["uplink", "downlink", "maintenance"];
    let mut sent = 0;
    for i in 0..48u16 {
        let mut record = match relay.acquire_record(NodeAddress::Beacon(i)) {
            Ok(record) => record,
            Err(RelayError::Arena(ArenaError::PoolExhausted { .. })) => {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            Err(e) => panic!("unexpected error: {}", e),
        };
        record.set_payload(&i.to_le_bytes()).unwrap();
        relay
            .enqueue_by_name(names[i as usize % 3], record)
            .unwrap();
        sent += 1;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while handled.load(Ordering::SeqCst) < sent && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    relay.shutdown();

    assert_eq!(handled.load(Ordering::SeqCst), sent);
    assert_eq!(relay.arena().outstanding(), 0);
    assert_eq!(relay.stats().workers_alive, 0);
}
