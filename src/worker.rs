//! Producer and consumer workers plus the handles the controller uses to track and join them.
//!
//! Each worker runs on its own named OS thread. Workers never start or stop each other: the
//! controller owns every [`WorkerHandle`] and is the only party that signals a [`StopToken`] or
//! closes the buffer.

use crate::buffer::PriorityBoundedBuffer;
use crate::config::MillisRange;
use crate::error::BufferError;
use crate::events::{EventBus, SystemEvent, WorkerRole};
use crate::item::{ItemSource, PriorityItem};
use crate::metrics::MetricsCollector;
use crate::priority::{Priority, PriorityTable};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cooperative cancellation signal shared between the controller and its workers.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake anything parked in [`sleep`](Self::sleep).
    pub fn stop(&self) {
        *self.inner.stopped.lock() = true;
        self.inner.signal.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep for `duration` or until stopped. Returns `true` if the token was stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if !*stopped && !duration.is_zero() {
            let _ = self
                .inner
                .signal
                .wait_while_for(&mut stopped, |stopped| !*stopped, duration);
        }
        *stopped
    }
}

/// How a producer picks the priority of each new item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PriorityDistribution {
    /// Each of the four classes with equal probability.
    #[default]
    Uniform,
    /// Relative weights per class; all-zero weights fall back to uniform.
    Weighted(PriorityTable<u32>),
    /// Always the same class.
    Fixed(Priority),
    /// Repeat the given classes in order.
    Cycle(Vec<Priority>),
}

impl PriorityDistribution {
    /// Priority for the `index`-th item of a producer.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, index: usize) -> Priority {
        match self {
            PriorityDistribution::Uniform => Priority::ALL[rng.gen_range(0..Priority::ALL.len())],
            PriorityDistribution::Weighted(weights) => {
                let total: u64 = weights.iter().map(|(_, w)| u64::from(*w)).sum();
                if total == 0 {
                    return PriorityDistribution::Uniform.sample(rng, index);
                }
                let mut pick = rng.gen_range(0..total);
                for (priority, weight) in weights.iter() {
                    let weight = u64::from(*weight);
                    if pick < weight {
                        return priority;
                    }
                    pick -= weight;
                }
                Priority::Low
            }
            PriorityDistribution::Fixed(priority) => *priority,
            PriorityDistribution::Cycle(sequence) if sequence.is_empty() => {
                PriorityDistribution::Uniform.sample(rng, index)
            }
            PriorityDistribution::Cycle(sequence) => sequence[index % sequence.len()],
        }
    }
}

fn sample_delay<R: Rng + ?Sized>(rng: &mut R, range: MillisRange) -> Duration {
    let range = range.as_range();
    if range.end() == &0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(range))
}

/// Generates a fixed quota of items and terminates.
#[derive(Debug)]
pub struct ProducerWorker {
    pub id: usize,
    pub items: usize,
    pub buffer: Arc<PriorityBoundedBuffer>,
    pub distribution: PriorityDistribution,
    pub delay: MillisRange,
    pub stop: StopToken,
}

impl ProducerWorker {
    /// Produce until the quota is met, the buffer closes, or the token is stopped.
    ///
    /// `produced` is incremented after every successful `put` so the controller can read
    /// progress while the worker runs. Returns the number of items inserted.
    pub fn run(self, produced: &AtomicU64) -> u64 {
        let mut rng = StdRng::from_entropy();
        let mut count = 0u64;
        for index in 0..self.items {
            if self.stop.is_stopped() {
                break;
            }
            let priority = self.distribution.sample(&mut rng, index);
            let item = PriorityItem::new(
                priority,
                format!("Producer-{}-Item-{}", self.id, index),
                ItemSource::Producer(self.id),
            );
            let item_id = item.id();
            match self.buffer.put(item, None) {
                Ok(()) => {
                    count += 1;
                    produced.fetch_add(1, Ordering::Relaxed);
                    debug!(producer = self.id, item_id, %priority, "produced item");
                }
                Err(BufferError::Closed) => {
                    debug!(producer = self.id, "buffer closed, producer exiting");
                    break;
                }
                Err(err) => {
                    warn!(producer = self.id, %err, "unexpected put failure, producer exiting");
                    break;
                }
            }
            if self.stop.sleep(sample_delay(&mut rng, self.delay)) {
                break;
            }
        }
        info!(producer = self.id, produced = count, "producer finished");
        count
    }
}

/// Dequeues and processes items until stopped or the buffer closes.
#[derive(Debug)]
pub struct ConsumerWorker {
    pub id: usize,
    pub buffer: Arc<PriorityBoundedBuffer>,
    pub stop: StopToken,
    /// Bound on each `get`; the worker re-checks `stop` at least this often while idle.
    pub poll_timeout: Duration,
    pub processing_time: MillisRange,
    pub metrics: Arc<MetricsCollector>,
}

impl ConsumerWorker {
    /// Consume until stopped. Returns the number of items processed.
    ///
    /// An item already taken from the buffer is always processed to completion.
    pub fn run(self, consumed: &AtomicU64) -> u64 {
        let mut rng = StdRng::from_entropy();
        let mut count = 0u64;
        while !self.stop.is_stopped() {
            match self.buffer.get(Some(self.poll_timeout)) {
                Ok(item) => {
                    let wait = item.age();
                    self.metrics.record_wait(item.priority(), wait);
                    debug!(
                        consumer = self.id,
                        item_id = item.id(),
                        priority = %item.priority(),
                        source = %item.source(),
                        wait_ms = wait.as_secs_f64() * 1_000.0,
                        "consuming item"
                    );
                    let processing = sample_delay(&mut rng, self.processing_time);
                    if !processing.is_zero() {
                        thread::sleep(processing);
                    }
                    count += 1;
                    consumed.fetch_add(1, Ordering::Relaxed);
                }
                Err(BufferError::TimedOut) => continue,
                Err(BufferError::Closed) => {
                    debug!(consumer = self.id, "buffer closed, consumer exiting");
                    break;
                }
            }
        }
        info!(consumer = self.id, consumed = count, "consumer stopped");
        count
    }
}

/// Lifecycle status of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

/// Final accounting for one joined worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub role: WorkerRole,
    pub id: usize,
    pub items: u64,
    /// `false` if the worker thread panicked.
    pub clean_exit: bool,
}

/// Flips the liveness flag when the worker thread ends, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Controller-side handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    role: WorkerRole,
    id: usize,
    alive: Arc<AtomicBool>,
    items: Arc<AtomicU64>,
    thread: JoinHandle<u64>,
}

impl WorkerHandle {
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn status(&self) -> WorkerStatus {
        if self.alive.load(Ordering::Acquire) {
            WorkerStatus::Running
        } else {
            WorkerStatus::Stopped
        }
    }

    /// Items produced or consumed so far.
    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    /// Shared liveness flag, for status reads that must not touch the handle collection.
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Wait for the worker thread to end.
    pub fn join(self) -> WorkerSummary {
        let (items, clean_exit) = match self.thread.join() {
            Ok(items) => (items, true),
            Err(_) => {
                warn!(role = ?self.role, worker = self.id, "worker thread panicked");
                (self.items.load(Ordering::Relaxed), false)
            }
        };
        WorkerSummary {
            role: self.role,
            id: self.id,
            items,
            clean_exit,
        }
    }
}

fn spawn_worker<F>(
    role: WorkerRole,
    id: usize,
    events: Arc<EventBus>,
    body: F,
) -> std::io::Result<WorkerHandle>
where
    F: FnOnce(&AtomicU64) -> u64 + Send + 'static,
{
    let alive = Arc::new(AtomicBool::new(true));
    let items = Arc::new(AtomicU64::new(0));
    let name = match role {
        WorkerRole::Producer => format!("Producer-{id}"),
        WorkerRole::Consumer => format!("Consumer-{id}"),
    };

    let thread_alive = alive.clone();
    let thread_items = items.clone();
    let thread = thread::Builder::new().name(name).spawn(move || {
        let _guard = AliveGuard(thread_alive);
        events.publish(SystemEvent::WorkerStarted {
            role,
            worker_id: id,
        });
        let total = body(&thread_items);
        events.publish(SystemEvent::WorkerFinished {
            role,
            worker_id: id,
            items: total,
        });
        total
    })?;

    Ok(WorkerHandle {
        role,
        id,
        alive,
        items,
        thread,
    })
}

/// Start `worker` on a dedicated thread named `Producer-<id>`.
pub fn spawn_producer(
    worker: ProducerWorker,
    events: Arc<EventBus>,
) -> std::io::Result<WorkerHandle> {
    let id = worker.id;
    spawn_worker(WorkerRole::Producer, id, events, move |produced| {
        worker.run(produced)
    })
}

/// Start `worker` on a dedicated thread named `Consumer-<id>`.
pub fn spawn_consumer(
    worker: ConsumerWorker,
    events: Arc<EventBus>,
) -> std::io::Result<WorkerHandle> {
    let id = worker.id;
    spawn_worker(WorkerRole::Consumer, id, events, move |consumed| {
        worker.run(consumed)
    })
}
