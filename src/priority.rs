//! Strict-priority classes and per-class tables used across the scheduler.

use crate::config::MAX_PRIORITIES;
use crate::error::{TmError, TmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Strict-priority class, 0 (highest) through 15 (lowest).
///
/// Siblings in a lower-numbered class are always serviced before any sibling
/// in a higher-numbered class; WFQ only arbitrates within one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(MAX_PRIORITIES as u8 - 1);

    pub fn new(class: u8) -> TmResult<Self> {
        if class as usize >= MAX_PRIORITIES {
            return Err(TmError::invalid_param(
                "priority",
                format!("{class} is outside 0..{MAX_PRIORITIES}"),
            ));
        }
        Ok(Priority(class))
    }

    /// Stable index for priority based arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Every class from highest to lowest.
    pub fn all() -> impl Iterator<Item = Priority> {
        (0..MAX_PRIORITIES as u8).map(Priority)
    }
}

impl TryFrom<u8> for Priority {
    type Error = TmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Helper structure wrapping a value per [`Priority`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTable<T> {
    values: Vec<T>,
}

impl<T> PriorityTable<T> {
    /// Build a table by executing a closure for each priority, highest first.
    ///
    /// # Example
    /// ```
    /// use tm_scheduler::priority::{Priority, PriorityTable};
    ///
    /// let weights = PriorityTable::from_fn(|priority| if priority == Priority::HIGHEST { 8 } else { 1 });
    /// assert_eq!(weights[Priority::HIGHEST], 8);
    /// ```
    pub fn from_fn(mut f: impl FnMut(Priority) -> T) -> Self {
        let mut values = Vec::with_capacity(MAX_PRIORITIES);
        for priority in Priority::all() {
            values.push(f(priority));
        }
        PriorityTable { values }
    }

    pub fn get(&self, priority: Priority) -> &T {
        &self.values[priority.index()]
    }

    pub fn get_mut(&mut self, priority: Priority) -> &mut T {
        &mut self.values[priority.index()]
    }

    /// Build a table from a vector ordered highest class first.
    ///
    /// # Panics
    /// Panics if `values.len()` differs from the number of priority classes.
    pub fn from_vec(values: Vec<T>) -> Self {
        assert!(
            values.len() == MAX_PRIORITIES,
            "priority table expects {} entries, got {}",
            MAX_PRIORITIES,
            values.len()
        );
        PriorityTable { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        Priority::all().zip(self.values.iter())
    }

    /// Entries held; differs from the class count only for tables
    /// deserialized from malformed input.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<T: Clone> PriorityTable<T> {
    pub fn splat(value: T) -> Self {
        PriorityTable {
            values: vec![value; MAX_PRIORITIES],
        }
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
