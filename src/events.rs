//! Push-style observation of buffer and worker activity.
//!
//! Subscribers receive [`SystemEvent`]s through bounded crossbeam channels. Publishing never
//! blocks: when a subscriber falls behind, events for that subscriber are dropped, and
//! subscribers whose receiver was dropped are pruned on the next publish.

use crate::buffer::BufferSnapshot;
use crate::config::SystemConfig;
use crate::item::ItemSource;
use crate::priority::Priority;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

/// Default queue depth for a subscriber channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Kind of worker an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Producer,
    Consumer,
}

/// Mutation that caused a [`SystemEvent::BufferChanged`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BufferChange {
    Produced {
        item_id: u64,
        priority: Priority,
        source: ItemSource,
    },
    Consumed {
        item_id: u64,
        priority: Priority,
    },
}

/// Everything an observer can be told about.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SystemEvent {
    /// Buffer contents changed; `snapshot` was taken inside the same exclusive section as the
    /// mutation, so it is internally consistent.
    BufferChanged {
        change: BufferChange,
        snapshot: BufferSnapshot,
    },
    WorkerStarted {
        role: WorkerRole,
        worker_id: usize,
    },
    WorkerFinished {
        role: WorkerRole,
        worker_id: usize,
        items: u64,
    },
    SystemStarted {
        config: SystemConfig,
    },
    SystemStopped {
        snapshot: BufferSnapshot,
    },
}

/// Fan-out of events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SystemEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber whose channel buffers at most `capacity` undelivered events.
    pub fn subscribe(&self, capacity: usize) -> Receiver<SystemEvent> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every live subscriber without blocking.
    pub fn publish(&self, event: SystemEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(worker_id: usize) -> SystemEvent {
        SystemEvent::WorkerStarted {
            role: WorkerRole::Producer,
            worker_id,
        }
    }

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let a = bus.subscribe(8);
        let b = bus.subscribe(8);
        bus.publish(started(1));

        assert!(matches!(a.try_recv(), Ok(SystemEvent::WorkerStarted { worker_id: 1, .. })));
        assert!(matches!(b.try_recv(), Ok(SystemEvent::WorkerStarted { worker_id: 1, .. })));
    }

    #[test]
    fn full_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let rx = bus.subscribe(1);
        bus.publish(started(1));
        bus.publish(started(2));

        assert!(matches!(rx.try_recv(), Ok(SystemEvent::WorkerStarted { worker_id: 1, .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(4);
        drop(rx);
        bus.publish(started(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
