//! In-process key-value store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Key-value store held in process memory.
///
/// Cheap to share through an `Arc`; every operation takes the same lock, so
/// [`remove_if`](KeyValueStore::remove_if) is atomic with respect to all others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn remove_if(&self, key: &str, accept: &dyn Fn(&str) -> bool) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        let value = entries.get(key).cloned();
        if let Some(value) = &value {
            if accept(value) {
                entries.remove(key);
            }
        }
        Ok(value)
    }
}

static SESSION_STORE: OnceLock<Arc<MemoryStore>> = OnceLock::new();

/// The process-wide store behind `session` storage.
///
/// Lives as long as the process; every call returns the same store.
pub fn session_store() -> Arc<dyn KeyValueStore> {
    SESSION_STORE
        .get_or_init(|| Arc::new(MemoryStore::new()))
        .clone()
}
