//! Storage backends
//!
//! A uniform key/value + list + counter contract over three substrates
//! (local filesystem, Redis, MongoDB) plus an in-process memory store used to
//! exercise the shared-store code paths without a server.
//!
//! Backends only move bytes. [`Storage`] layers the text / object codec on
//! top and owns key derivation for the experiment it belongs to.
//!
//! # Example
//!
//! ```rust
//! use trialbook::backend::{MemoryBackend, Storage};
//!
//! # fn example() -> trialbook::Result<()> {
//! let storage = Storage::new(MemoryBackend::new("quickstart"));
//! let key = storage.code_key(1);
//! storage.save_text(&key, "fn main() {}")?;
//! assert_eq!(storage.load_text(&key)?, "fn main() {}");
//! # Ok(())
//! # }
//! ```

mod local;
mod memory;
#[cfg(feature = "mongo")]
mod mongo;
#[cfg(feature = "redis")]
mod redis;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "mongo")]
pub use mongo::MongoBackend;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::BackendSpec;
use crate::key::{Key, Segment};
use crate::{Error, Result, TrialId};

/// Substrate tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Files under a per-experiment cache directory
    Local,
    /// In-process `DashMap`
    Memory,
    /// Redis server
    Redis,
    /// MongoDB server
    Mongo,
}

impl BackendKind {
    /// Whether trial ids, parameter history, result history and metrics
    /// live entirely in the backend (as opposed to in-memory state that is
    /// snapshotted through the experiment).
    #[must_use]
    pub const fn is_shared_store(self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Byte-level backend contract.
///
/// Missing scalar slots are `Ok(None)`, missing lists are empty, and
/// substrate failures are returned as-is.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Experiment this backend instance is bound to.
    fn experiment_id(&self) -> &str;

    /// Substrate tag.
    fn kind(&self) -> BackendKind;

    /// Connection string or path, for display.
    fn location(&self) -> String;

    /// Native rendering of a key (path, colon string, selector).
    fn native_key(&self, key: &Key) -> String;

    /// Last-write-wins scalar slot.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn set(&self, key: &Key, value: Vec<u8>) -> Result<()>;

    /// Read a scalar slot.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Append to a list.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()>;

    /// Read a whole list, in append order. Missing keys yield an empty list.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>>;

    /// Atomic fetch-and-add starting from 0; returns the new value.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn increment(&self, key: &Key) -> Result<u64>;

    /// Concrete keys matching a pattern with wildcard segments.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn keys(&self, pattern: &Key) -> Result<Vec<Key>>;

    /// Remove all persisted state of the experiment.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn delete_cache(&self) -> Result<()>;

    /// Persist the whole-experiment snapshot. Database-like backends keep
    /// all state in their records already and ignore it.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn save_state(&self, _state: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Load the whole-experiment snapshot, if one was saved.
    ///
    /// # Errors
    /// Substrate I/O errors.
    fn load_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Open the backend a [`BackendSpec`] selects for `experiment_id`.
///
/// Connections are not made here; Redis and MongoDB clients are created
/// lazily on first use.
///
/// # Errors
/// `Io` if the local cache directory cannot be created, or `Other` when the
/// selected substrate was compiled out.
pub fn open_backend(
    experiment_id: &str,
    spec: &BackendSpec,
    cache_root: &Path,
) -> Result<Arc<dyn Backend>> {
    match spec {
        BackendSpec::Local(path) => {
            let root = path.clone().unwrap_or_else(|| cache_root.to_path_buf());
            Ok(Arc::new(LocalBackend::open(experiment_id, root)?))
        }
        BackendSpec::Memory => Ok(Arc::new(MemoryBackend::new(experiment_id))),
        #[cfg(feature = "redis")]
        BackendSpec::Redis(uri) => Ok(Arc::new(RedisBackend::new(experiment_id, uri.clone()))),
        #[cfg(feature = "mongo")]
        BackendSpec::Mongo(uri) => Ok(Arc::new(MongoBackend::new(experiment_id, uri.clone()))),
        #[allow(unreachable_patterns)]
        other => Err(Error::Other(format!(
            "Backend support was not compiled in: {other}"
        ))),
    }
}

/// Codec and key-derivation layer over a [`Backend`].
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Storage").field(&self.backend).finish()
    }
}

impl Storage {
    /// Wrap a concrete backend.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Wrap a shared backend.
    #[must_use]
    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Underlying backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Experiment the backend is bound to.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        self.backend.experiment_id()
    }

    /// Substrate tag.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // ------------------------------------------------------------------
    // Key derivation
    // ------------------------------------------------------------------

    /// Trial-id counter key.
    #[must_use]
    pub fn trial_counter_key(&self) -> Key {
        Key::trial_counter(self.experiment_id())
    }

    /// Parameter snapshot key.
    #[must_use]
    pub fn parameter_key(&self, trial_id: TrialId) -> Key {
        Key::parameter(self.experiment_id(), Segment::Exact(trial_id))
    }

    /// Result record key.
    #[must_use]
    pub fn history_key(&self, trial_id: TrialId) -> Key {
        Key::history(self.experiment_id(), Segment::Exact(trial_id))
    }

    /// Metric series key.
    #[must_use]
    pub fn metric_key(&self, metric: &str, trial_id: TrialId) -> Key {
        Key::metric(
            self.experiment_id(),
            Segment::Exact(metric.to_string()),
            Segment::Exact(trial_id),
        )
    }

    /// Persisted step output key.
    #[must_use]
    pub fn persist_key(&self, step: &str, trial_id: TrialId) -> Key {
        Key::persist(self.experiment_id(), step, Segment::Exact(trial_id))
    }

    /// Code snapshot key.
    #[must_use]
    pub fn code_key(&self, trial_id: TrialId) -> Key {
        Key::code(self.experiment_id(), Segment::Exact(trial_id))
    }

    /// Environment snapshot key.
    #[must_use]
    pub fn environment_key(&self, collector: &str, trial_id: TrialId) -> Key {
        Key::environment(self.experiment_id(), collector, Segment::Exact(trial_id))
    }

    /// Step fingerprint key.
    #[must_use]
    pub fn step_hash_key(&self, input_key: &str) -> Key {
        Key::step_hash(self.experiment_id(), input_key)
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// See [`Backend::set`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn set(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.backend.set(key, value)
    }

    /// See [`Backend::get`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.backend.get(key)
    }

    /// See [`Backend::append_list`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.backend.append_list(key, value)
    }

    /// See [`Backend::get_list`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        self.backend.get_list(key)
    }

    /// See [`Backend::increment`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn increment(&self, key: &Key) -> Result<u64> {
        self.backend.increment(key)
    }

    /// See [`Backend::keys`]. Results are sorted.
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn keys(&self, pattern: &Key) -> Result<Vec<Key>> {
        let mut keys = self.backend.keys(pattern)?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// See [`Backend::delete_cache`].
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn delete_cache(&self) -> Result<()> {
        self.backend.delete_cache()
    }

    // ------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------

    /// Save UTF-8 text.
    ///
    /// # Errors
    /// Substrate I/O errors.
    pub fn save_text(&self, key: &Key, text: &str) -> Result<()> {
        tracing::debug!(key = %self.backend.native_key(key), "saving text");
        self.backend.set(key, text.as_bytes().to_vec())
    }

    /// Load UTF-8 text.
    ///
    /// # Errors
    /// `RecordNotFound` if the slot is absent; substrate errors otherwise.
    pub fn load_text(&self, key: &Key) -> Result<String> {
        let bytes = self
            .backend
            .get(key)?
            .ok_or_else(|| Error::RecordNotFound(self.backend.native_key(key)))?;
        String::from_utf8(bytes).map_err(|e| Error::StorageError(e.to_string()))
    }

    /// Save a serializable object.
    ///
    /// # Errors
    /// Codec or substrate errors.
    pub fn save_object<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<()> {
        tracing::debug!(key = %self.backend.native_key(key), "saving object");
        self.backend.set(key, serde_json::to_vec(value)?)
    }

    /// Load a deserializable object.
    ///
    /// # Errors
    /// `RecordNotFound` if the slot is absent; codec or substrate errors
    /// otherwise.
    pub fn load_object<T: DeserializeOwned>(&self, key: &Key) -> Result<T> {
        let bytes = self
            .backend
            .get(key)?
            .ok_or_else(|| Error::RecordNotFound(self.backend.native_key(key)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append a serializable object to a list.
    ///
    /// # Errors
    /// Codec or substrate errors.
    pub fn append_object<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<()> {
        self.backend.append_list(key, serde_json::to_vec(value)?)
    }

    /// Load every object of a list.
    ///
    /// # Errors
    /// Codec or substrate errors.
    pub fn load_list<T: DeserializeOwned>(&self, key: &Key) -> Result<Vec<T>> {
        self.backend
            .get_list(key)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Storage {
        Storage::new(MemoryBackend::new("dummy_experiment"))
    }

    #[test]
    fn test_text_roundtrip() {
        let s = storage();
        let key = s.code_key(1);
        s.save_text(&key, "let x = 1;").unwrap();
        assert_eq!(s.load_text(&key).unwrap(), "let x = 1;");
    }

    #[test]
    fn test_missing_text_is_record_not_found() {
        let s = storage();
        let err = s.load_text(&s.code_key(7)).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(_)));
        assert!(matches!(err.for_trial(7), Error::TrialNotFound(_)));
    }

    #[test]
    fn test_missing_object_is_record_not_found() {
        let s = storage();
        let err = s.load_object::<u32>(&s.history_key(3)).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(_)));
    }

    #[test]
    fn test_object_list() {
        let s = storage();
        let key = s.metric_key("loss", 1);
        assert!(s.load_list::<f64>(&key).unwrap().is_empty());
        s.append_object(&key, &0.5).unwrap();
        s.append_object(&key, &0.25).unwrap();
        assert_eq!(s.load_list::<f64>(&key).unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn test_keys_sorted() {
        let s = storage();
        for trial in [3, 1, 2] {
            s.save_object(&s.parameter_key(trial), &trial).unwrap();
        }
        let pattern = Key::parameter(s.experiment_id(), Segment::Wildcard);
        let trials: Vec<_> = s.keys(&pattern).unwrap().iter().filter_map(Key::trial_id).collect();
        assert_eq!(trials, vec![1, 2, 3]);
    }

    #[test]
    fn test_shared_store_kinds() {
        assert!(!BackendKind::Local.is_shared_store());
        assert!(BackendKind::Memory.is_shared_store());
        assert!(BackendKind::Redis.is_shared_store());
        assert!(BackendKind::Mongo.is_shared_store());
    }
}
