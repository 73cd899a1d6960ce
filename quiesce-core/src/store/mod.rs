//! Key-value store capability used for batch persistence
//!
//! Stores hold raw string values by string key. The collector only needs
//! `get`/`set`/`delete`, plus one atomic primitive, [`KeyValueStore::remove_if`],
//! which backs the recovery claim: read a value and delete it in the same step
//! so that two collectors can never both take the same persisted batch.

mod memory;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

pub use memory::{session_store, MemoryStore};
pub use sqlite::SqliteStore;

use crate::config::{CollectorConfig, StorageType};
use crate::error::Result;

/// Synchronous durable key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read the value at `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` at `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically read `key` and delete it if `accept` returns true for the
    /// value. Returns the value read, whether or not it was deleted.
    ///
    /// No other operation on the same store may observe the key between the
    /// read and the delete.
    fn remove_if(&self, key: &str, accept: &dyn Fn(&str) -> bool) -> Result<Option<String>>;
}

/// Resolve the store a collector config asks for.
///
/// Returns `None` for memory-only collectors. A durable store that cannot be
/// opened degrades to memory-only with a warning.
pub fn open_for(config: &CollectorConfig) -> Option<Arc<dyn KeyValueStore>> {
    match config.storage {
        StorageType::Memory => None,
        StorageType::Session => Some(session_store()),
        StorageType::Local => open_local(&config.resolved_storage_path()),
    }
}

fn open_local(path: &Path) -> Option<Arc<dyn KeyValueStore>> {
    match SqliteStore::open(path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Durable store unavailable, falling back to memory-only"
            );
            None
        }
    }
}
