use crate::traits::{CacheStore, StoreError, StoredResponse};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// In-memory `CacheStore` backed by a single `RwLock`.
///
/// Generations are additive-only: entries are inserted and overwritten but
/// never individually removed, and the only eviction is deleting a whole
/// generation. That keeps locking trivial — lookups take a read lock, writes
/// a short write lock, and no entry-level coordination exists at all.
#[derive(Default)]
pub struct MemoryStore {
    generations: RwLock<AHashMap<String, AHashMap<String, Arc<StoredResponse>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn open(&self, generation: &str) -> Result<(), StoreError> {
        self.generations
            .write()
            .entry(generation.to_string())
            .or_default();
        Ok(())
    }

    fn lookup(
        &self,
        generation: &str,
        key: &str,
    ) -> Result<Option<Arc<StoredResponse>>, StoreError> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(
        &self,
        generation: &str,
        key: String,
        value: Arc<StoredResponse>,
    ) -> Result<(), StoreError> {
        let mut generations = self.generations.write();
        match generations.get_mut(generation) {
            Some(entries) => {
                entries.insert(key, value);
                Ok(())
            }
            None => Err(StoreError::UnknownGeneration(generation.to_string())),
        }
    }

    fn delete(&self, generation: &str) -> Result<bool, StoreError> {
        Ok(self.generations.write().remove(generation).is_some())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.generations.read().keys().cloned().collect())
    }

    fn len(&self, generation: &str) -> Result<usize, StoreError> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .map_or(0, |entries| entries.len()))
    }
}
