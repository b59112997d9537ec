//! Work item representation shared by producers, the buffer, and consumers.

use crate::priority::Priority;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static ITEM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Who created an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ItemSource {
    /// Generated by the producer worker with this identifier.
    Producer(usize),
    /// Injected through [`SystemController::add_manual_item`](crate::controller::SystemController::add_manual_item).
    Manual,
}

impl fmt::Display for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemSource::Producer(id) => write!(f, "producer-{id}"),
            ItemSource::Manual => f.write_str("manual"),
        }
    }
}

/// One immutable unit of work.
///
/// Each [`PriorityItem`] carries an opaque payload, the [`Priority`] the buffer orders it by, and
/// the creation timestamp consumers use to compute how long it waited.
#[derive(Debug, Clone)]
pub struct PriorityItem {
    id: u64,
    priority: Priority,
    payload: String,
    created_at: Instant,
    source: ItemSource,
}

impl PriorityItem {
    /// Create an item, assigning the next process-wide id.
    pub fn new(priority: Priority, payload: impl Into<String>, source: ItemSource) -> Self {
        PriorityItem {
            id: ITEM_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            priority,
            payload: payload.into(),
            created_at: Instant::now(),
            source,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn source(&self) -> ItemSource {
        self.source
    }

    /// Time elapsed since the item was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = PriorityItem::new(Priority::Low, "a", ItemSource::Manual);
        let b = PriorityItem::new(Priority::Low, "b", ItemSource::Producer(1));
        assert!(b.id() > a.id());
    }

    #[test]
    fn item_keeps_its_fields() {
        let item = PriorityItem::new(Priority::High, "payload", ItemSource::Producer(3));
        assert_eq!(item.priority(), Priority::High);
        assert_eq!(item.payload(), "payload");
        assert_eq!(item.source(), ItemSource::Producer(3));
        assert_eq!(item.source().to_string(), "producer-3");
    }
}
