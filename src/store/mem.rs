//! In-memory state store on DashMap.
//!
//! Test double for [`FsStateStore`] with identical semantics. Also usable
//! for ephemeral engines that never persist (dry-run tooling, doctests).

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::StoreError;
use crate::store::{StateStore, StoreResult};

/// Concurrent in-memory key-value store.
#[derive(Default)]
pub struct MemStateStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemStateStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemStateStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_vec());
                Ok(true)
            }
        }
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn move_key(&self, from: &str, to: &str) -> StoreResult<()> {
        match self.entries.remove(from) {
            Some((_, value)) => {
                self.entries.insert(to.to_string(), value);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                key: from.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for MemStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStateStore")
            .field("count", &self.len())
            .finish()
    }
}
