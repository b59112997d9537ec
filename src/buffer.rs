//! Capacity-bounded, priority-ordered buffer shared by producers and consumers.
//!
//! The buffer is built from three primitives:
//! 1. `empty_slots`: counting semaphore holding one permit per free slot (starts at capacity)
//! 2. `filled_slots`: counting semaphore holding one permit per queued item (starts at zero)
//! 3. `state`: mutex guarding the heap and the counters
//!
//! `put` takes an empty-slot permit, mutates the heap under the mutex, then releases a filled-slot
//! permit (waking one blocked `get`). `get` mirrors this. The mutex is held only for the heap
//! mutation and counter updates; all blocking happens on the semaphores.
//!
//! Ordering is a min-heap on `(priority, sequence)`. The sequence number is stamped inside the
//! exclusive section, so items of equal priority leave in global arrival order no matter which
//! producer inserted them.

use crate::error::BufferError;
use crate::events::{BufferChange, EventBus, SystemEvent};
use crate::item::PriorityItem;
use crate::priority::{Priority, PriorityTable};
use crate::semaphore::Semaphore;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

/// Item held in the heap together with its arrival sequence number.
#[derive(Debug)]
struct QueuedItem {
    priority: Priority,
    sequence: u64,
    item: PriorityItem,
}

impl Ord for QueuedItem {
    /// Reverse comparison so `BinaryHeap` pops the lowest `(priority, sequence)` first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedItem {}

/// Consistent point-in-time view of the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferSnapshot {
    pub size: usize,
    pub capacity: usize,
    pub total_produced: u64,
    pub total_consumed: u64,
    /// Current contents partitioned by priority; sums to `size`.
    pub count_by_priority: PriorityTable<usize>,
    /// Items ever inserted, per priority.
    pub produced_by_priority: PriorityTable<u64>,
    pub closed: bool,
}

#[derive(Debug)]
struct BufferState {
    heap: BinaryHeap<QueuedItem>,
    next_sequence: u64,
    total_produced: u64,
    total_consumed: u64,
    count_by_priority: PriorityTable<usize>,
    produced_by_priority: PriorityTable<u64>,
    closed: bool,
}

impl BufferState {
    fn snapshot(&self, capacity: usize) -> BufferSnapshot {
        BufferSnapshot {
            size: self.heap.len(),
            capacity,
            total_produced: self.total_produced,
            total_consumed: self.total_consumed,
            count_by_priority: self.count_by_priority.clone(),
            produced_by_priority: self.produced_by_priority.clone(),
            closed: self.closed,
        }
    }
}

/// Fixed-capacity priority buffer with blocking `put`/`get`.
#[derive(Debug)]
pub struct PriorityBoundedBuffer {
    capacity: usize,
    empty_slots: Semaphore,
    filled_slots: Semaphore,
    state: Mutex<BufferState>,
    events: Option<Arc<EventBus>>,
}

impl PriorityBoundedBuffer {
    /// Create an empty buffer holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            capacity,
            empty_slots: Semaphore::new(capacity),
            filled_slots: Semaphore::new(0),
            state: Mutex::new(BufferState {
                heap: BinaryHeap::with_capacity(capacity),
                next_sequence: 0,
                total_produced: 0,
                total_consumed: 0,
                count_by_priority: PriorityTable::default(),
                produced_by_priority: PriorityTable::default(),
                closed: false,
            }),
            events: None,
        }
    }

    /// Create a buffer that publishes a [`SystemEvent::BufferChanged`] after every mutation.
    pub fn with_events(capacity: usize, events: Arc<EventBus>) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.events = Some(events);
        buffer
    }

    /// Insert `item`, blocking while the buffer is full.
    ///
    /// On any error the item is not inserted and no counter changes.
    ///
    /// # Arguments
    /// * `item` - The item to enqueue (carries its priority and creation time)
    /// * `timeout` - Bound on the wait for a free slot; `None` waits until space frees up or the
    ///   buffer closes
    ///
    /// # Returns
    /// `Ok(())` once the item is queued, `Err(TimedOut)` if no slot freed up in time,
    /// `Err(Closed)` if the buffer was closed before or during the wait
    pub fn put(&self, item: PriorityItem, timeout: Option<Duration>) -> Result<(), BufferError> {
        // Reserve a free slot; this is the only place a producer blocks
        self.empty_slots.acquire(timeout)?;

        let observed = self.wants_snapshot();
        let published = {
            let mut state = self.state.lock();
            if state.closed {
                // Closed while we held the permit: hand it back untouched
                drop(state);
                self.empty_slots.release();
                return Err(BufferError::Closed);
            }
            let priority = item.priority();
            let change = observed.then(|| BufferChange::Produced {
                item_id: item.id(),
                priority,
                source: item.source(),
            });
            // Stamp the arrival order inside the lock so ties break globally
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueuedItem {
                priority,
                sequence,
                item,
            });
            state.total_produced += 1;
            state.count_by_priority[priority] += 1;
            state.produced_by_priority[priority] += 1;
            change.map(|change| (change, state.snapshot(self.capacity)))
            // Mutex is released here
        };

        // Wake one blocked consumer, then notify observers outside the lock
        self.filled_slots.release();
        self.publish(published);
        Ok(())
    }

    /// Insert without waiting for a free slot.
    pub fn try_put(&self, item: PriorityItem) -> Result<(), BufferError> {
        self.put(item, Some(Duration::ZERO))
    }

    /// Remove the most urgent item, blocking while the buffer is empty.
    ///
    /// Among items of equal priority the earliest inserted is returned.
    ///
    /// # Arguments
    /// * `timeout` - Bound on the wait for an item; `None` waits until one arrives or the buffer
    ///   closes
    ///
    /// # Returns
    /// The item with the lowest `(priority, sequence)`, `Err(TimedOut)` if nothing arrived in
    /// time, or `Err(Closed)` once the buffer is closed (even if items remain)
    pub fn get(&self, timeout: Option<Duration>) -> Result<PriorityItem, BufferError> {
        // Claim a queued item; consumers block here, never on the mutex
        self.filled_slots.acquire(timeout)?;

        let observed = self.wants_snapshot();
        let (item, published) = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                self.filled_slots.release();
                return Err(BufferError::Closed);
            }
            // Heap top is the most urgent, earliest-arrived item
            let queued = state
                .heap
                .pop()
                .expect("filled-slot permit guarantees a queued item");
            state.total_consumed += 1;
            state.count_by_priority[queued.priority] -= 1;
            let published = observed.then(|| {
                (
                    BufferChange::Consumed {
                        item_id: queued.item.id(),
                        priority: queued.priority,
                    },
                    state.snapshot(self.capacity),
                )
            });
            (queued.item, published)
        };

        // Free the slot for exactly one waiting producer
        self.empty_slots.release();
        self.publish(published);
        Ok(item)
    }

    /// Remove the most urgent item without waiting.
    pub fn try_get(&self) -> Result<PriorityItem, BufferError> {
        self.get(Some(Duration::ZERO))
    }

    /// Consistent point-in-time statistics.
    pub fn snapshot(&self) -> BufferSnapshot {
        self.state.lock().snapshot(self.capacity)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the buffer: every blocked and future `put`/`get` returns [`BufferError::Closed`].
    ///
    /// Items still queued stay visible through [`snapshot`](Self::snapshot). Closing twice is a
    /// no-op.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.empty_slots.close();
        self.filled_slots.close();
    }

    fn wants_snapshot(&self) -> bool {
        self.events
            .as_ref()
            .is_some_and(|bus| bus.subscriber_count() > 0)
    }

    fn publish(&self, published: Option<(BufferChange, BufferSnapshot)>) {
        if let (Some(bus), Some((change, snapshot))) = (self.events.as_ref(), published) {
            bus.publish(SystemEvent::BufferChanged { change, snapshot });
        }
    }
}
