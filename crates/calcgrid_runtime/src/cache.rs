//! Value caches used while executing jobs.
//!
//! The shared cache lives for one execution request and is visible to every
//! job. A private cache lives for one job and holds the values the plan
//! classified as private to its fragment.

use calcgrid_core::{ComputedValue, ValueId};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Values visible to every job of an execution request
#[derive(Debug, Default)]
pub struct SharedValueCache {
    values: RwLock<BTreeMap<ValueId, serde_json::Value>>,
}

impl SharedValueCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache seeded with root inputs
    #[must_use]
    pub fn with_values(values: BTreeMap<ValueId, serde_json::Value>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, value: &ValueId) -> Option<serde_json::Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(value)
            .cloned()
    }

    /// Check for a value
    #[must_use]
    pub fn contains(&self, value: &ValueId) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(value)
    }

    /// Publish a value
    pub fn insert(&self, value: ValueId, payload: serde_json::Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value, payload);
    }

    /// Publish several values under one lock
    pub fn extend(&self, values: impl IntoIterator<Item = ComputedValue>) {
        let mut guard = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for v in values {
            guard.insert(v.value, v.payload);
        }
    }

    /// Number of cached values
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every cached value
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ValueId, serde_json::Value> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Values visible only inside one job
#[derive(Debug, Clone, Default)]
pub struct PrivateValueCache {
    values: BTreeMap<ValueId, serde_json::Value>,
}

impl PrivateValueCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, value: &ValueId) -> Option<&serde_json::Value> {
        self.values.get(value)
    }

    /// Store a value
    pub fn insert(&mut self, value: ValueId, payload: serde_json::Value) {
        self.values.insert(value, payload);
    }

    /// Number of cached values
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
