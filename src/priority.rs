//! Priority classes and per-class lookup tables shared by the buffer, workers, and metrics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

/// Urgency classes ordered from most to least urgent.
///
/// Lower discriminant means more urgent: the buffer always hands out `Critical` work before
/// `High`, `High` before `Medium`, and so on. The derived `Ord` follows declaration order, so
/// `Priority::Critical < Priority::Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// Ordered list of all priorities (most urgent first) for iteration utilities.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Stable index for priority based arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Upper-case label used on the wire and in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a priority label does not name one of the four classes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid priority: {0}")]
pub struct ParsePriorityError(pub String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// Helper structure wrapping a value per [`Priority`].
///
/// Serialises as a map keyed by priority name so snapshots read naturally as JSON
/// (`{"CRITICAL": 1, "HIGH": 0, ...}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable<T> {
    values: Vec<T>,
}

impl<T> PriorityTable<T> {
    /// Build a table by executing a closure for each priority, in [`Priority::ALL`] order.
    pub fn from_fn(mut f: impl FnMut(Priority) -> T) -> Self {
        let mut values = Vec::with_capacity(Priority::ALL.len());
        for priority in Priority::ALL {
            values.push(f(priority));
        }
        PriorityTable { values }
    }

    /// Borrow the value for a given priority.
    pub fn get(&self, priority: Priority) -> &T {
        &self.values[priority.index()]
    }

    /// Mutably borrow the value for a given priority.
    pub fn get_mut(&mut self, priority: Priority) -> &mut T {
        &mut self.values[priority.index()]
    }

    /// Iterate `(priority, value)` pairs from most to least urgent.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        Priority::ALL.into_iter().zip(self.values.iter())
    }
}

impl<T: Default> Default for PriorityTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<Priority> for PriorityTable<T> {
    type Output = T;

    fn index(&self, index: Priority) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Priority> for PriorityTable<T> {
    fn index_mut(&mut self, index: Priority) -> &mut Self::Output {
        self.get_mut(index)
    }
}

impl<T: Serialize> Serialize for PriorityTable<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (priority, value) in self.iter() {
            map.serialize_entry(priority.name(), value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de> + Default> Deserialize<'de> for PriorityTable<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = std::collections::HashMap::<Priority, T>::deserialize(deserializer)?;
        let mut table = PriorityTable::default();
        for (priority, value) in entries {
            table[priority] = value;
        }
        Ok(table)
    }
}
