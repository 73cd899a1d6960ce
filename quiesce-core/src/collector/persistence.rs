//! Mirrors a collector's buffer into a key-value store
//!
//! The persisted value is a JSON array of items. An absent key means "no
//! pending batch"; an empty array is never written. Anything at the key that is
//! not an array of items is treated as someone else's data and never
//! overwritten or deleted by recovery.

use std::cell::RefCell;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::KeyValueStore;

/// What is currently stored under a persistence key
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedState<T> {
    /// No pending batch
    Absent,
    /// A pending batch written by a collector
    Batch(Vec<T>),
    /// A value that is not a batch of items (left untouched)
    Foreign(String),
}

/// A store plus the key a collector's batch lives under
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Non-destructive read. Absent, unreadable and foreign values all read
    /// as an empty batch.
    pub fn read<T: DeserializeOwned>(&self) -> Vec<T> {
        match self.inspect() {
            PersistedState::Batch(items) => items,
            PersistedState::Absent | PersistedState::Foreign(_) => Vec::new(),
        }
    }

    /// Classify the value under the key without modifying it.
    ///
    /// A store error reads as [`PersistedState::Absent`].
    pub fn inspect<T: DeserializeOwned>(&self) -> PersistedState<T> {
        match self.store.get(&self.key) {
            Ok(Some(raw)) => match decode_batch(&raw) {
                Some(items) => PersistedState::Batch(items),
                None => {
                    tracing::debug!(key = %self.key, "Persisted value is not a batch, ignoring it");
                    PersistedState::Foreign(raw)
                }
            },
            Ok(None) => PersistedState::Absent,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read persisted batch");
                PersistedState::Absent
            }
        }
    }

    /// Mirror `items` into the store: set when non-empty, delete when empty.
    ///
    /// Returns false if encoding or the store write failed.
    pub fn write<T: Serialize>(&self, items: &[T]) -> bool {
        let result = if items.is_empty() {
            self.store.delete(&self.key)
        } else {
            match serde_json::to_string(items) {
                Ok(encoded) => self.store.set(&self.key, &encoded),
                Err(e) => Err(e.into()),
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to persist batch");
                false
            }
        }
    }

    /// Atomically take the persisted batch, deleting it from the store.
    ///
    /// Of any number of claims against the same store and key, at most one
    /// observes a given batch. Foreign values are neither returned nor deleted.
    pub fn claim<T: DeserializeOwned>(&self) -> Vec<T> {
        let decoded: RefCell<Option<Vec<T>>> = RefCell::new(None);
        let accept = |raw: &str| match decode_batch(raw) {
            Some(items) => {
                *decoded.borrow_mut() = Some(items);
                true
            }
            None => false,
        };

        match self.store.remove_if(&self.key, &accept) {
            Ok(_) => decoded.into_inner().unwrap_or_default(),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to claim persisted batch");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence").field("key", &self.key).finish()
    }
}

/// Decode a raw value as a batch, or `None` if it is not an array of `T`.
fn decode_batch<T: DeserializeOwned>(raw: &str) -> Option<Vec<T>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if !value.is_array() {
        return None;
    }
    serde_json::from_value(value).ok()
}
