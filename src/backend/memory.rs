//! In-memory backend using `DashMap`.
//!
//! Data is lost on process restart. It behaves like a shared store (all
//! trial state lives in the backend), which makes it the test substrate for
//! the Redis/MongoDB code paths.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::{Backend, BackendKind};
use crate::key::Key;
use crate::Result;

/// In-memory backend using lock-free concurrent hashmaps.
///
/// Thread-safe; `increment` is atomic per key.
///
/// # Example
///
/// ```rust
/// use trialbook::backend::{Backend, MemoryBackend};
/// use trialbook::key::Key;
///
/// # fn example() -> trialbook::Result<()> {
/// let backend = MemoryBackend::new("exp");
/// let counter = Key::trial_counter("exp");
/// assert_eq!(backend.increment(&counter)?, 1);
/// assert_eq!(backend.increment(&counter)?, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryBackend {
    experiment_id: String,
    slots: DashMap<Key, Vec<u8>>,
    lists: DashMap<Key, Vec<Vec<u8>>>,
    counters: DashMap<Key, AtomicU64>,
}

impl MemoryBackend {
    /// Create an empty store bound to `experiment_id`.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            slots: DashMap::new(),
            lists: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Number of stored records (slots, lists and counters).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() + self.lists.len() + self.counters.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }

    fn native_key(&self, key: &Key) -> String {
        key.to_colon_string()
    }

    fn set(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.slots.insert(key.clone(), value);
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        if let Some(counter) = self.counters.get(key) {
            return Ok(Some(counter.load(Ordering::SeqCst).to_string().into_bytes()));
        }
        Ok(self.slots.get(key).map(|v| v.value().clone()))
    }

    fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.lists.entry(key.clone()).or_default().push(value);
        Ok(())
    }

    fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .lists
            .get(key)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    fn increment(&self, key: &Key) -> Result<u64> {
        let counter = self.counters.entry(key.clone()).or_default();
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn keys(&self, pattern: &Key) -> Result<Vec<Key>> {
        let slots = self.slots.iter().map(|e| e.key().clone());
        let lists = self.lists.iter().map(|e| e.key().clone());
        let counters = self.counters.iter().map(|e| e.key().clone());
        Ok(slots
            .chain(lists)
            .chain(counters)
            .filter(|k| pattern.matches(k))
            .collect())
    }

    fn delete_cache(&self) -> Result<()> {
        self.slots.clear();
        self.lists.clear();
        self.counters.clear();
        Ok(())
    }
}
