//! Where trial ids, parameter snapshots, result records and step hashes live.
//!
//! Two realizations:
//!
//! - [`LocalTrialRecords`]: everything is held in process memory and
//!   persisted through the experiment snapshot (local filesystem backend).
//! - [`SharedTrialRecords`]: everything lives in the backend; the object is a
//!   thin accessor (Redis, MongoDB, memory backends).

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::TrialResult;
use crate::backend::Storage;
use crate::key::{Key, Segment};
use crate::{Error, Result, TrialId, Value};

/// Parameter snapshot of one trial.
pub type ParameterSnapshot = BTreeMap<String, Value>;

/// Storage contract for trial bookkeeping.
pub trait TrialRecords: Send + Sync + fmt::Debug {
    /// Latest allocated trial id (0 when none).
    ///
    /// # Errors
    /// Substrate errors.
    fn latest_trial_id(&self) -> Result<TrialId>;

    /// Atomically advance the trial counter and return the new id.
    ///
    /// # Errors
    /// Substrate errors.
    fn allocate(&self) -> Result<TrialId>;

    /// Persist the parameter snapshot for `trial_id`.
    ///
    /// # Errors
    /// Substrate errors.
    fn save_parameters(&self, trial_id: TrialId, params: &ParameterSnapshot) -> Result<()>;

    /// Load the parameter snapshot for `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` when no snapshot exists.
    fn load_parameters(&self, trial_id: TrialId) -> Result<ParameterSnapshot>;

    /// Persist the result record for `trial_id`.
    ///
    /// # Errors
    /// Substrate errors.
    fn save_result(&self, trial_id: TrialId, result: &TrialResult) -> Result<()>;

    /// Load the result record for `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` when no record exists.
    fn load_result(&self, trial_id: TrialId) -> Result<TrialResult>;

    /// Every saved parameter snapshot, by trial id.
    ///
    /// # Errors
    /// Substrate errors.
    fn parameter_history(&self) -> Result<BTreeMap<TrialId, ParameterSnapshot>>;

    /// Every saved result record, by trial id.
    ///
    /// # Errors
    /// Substrate errors.
    fn result_history(&self) -> Result<BTreeMap<TrialId, TrialResult>>;

    /// Store `output_hash` for `input_key` and return the previous hash, or
    /// `output_hash` itself when none was stored.
    ///
    /// # Errors
    /// Substrate errors.
    fn update_step_hash(&self, input_key: &str, output_hash: &str) -> Result<String>;
}

/// Serializable state of [`LocalTrialRecords`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalTrialState {
    /// Latest allocated trial id
    pub trial_id: TrialId,
    /// Parameter snapshots
    pub parameters: BTreeMap<TrialId, ParameterSnapshot>,
    /// Result records
    pub results: BTreeMap<TrialId, TrialResult>,
    /// Step fingerprints (`<step>-<input hash>` to output hash)
    pub hashes: BTreeMap<String, String>,
}

/// In-process realization, snapshotted by the experiment.
#[derive(Debug, Default)]
pub struct LocalTrialRecords {
    state: RwLock<LocalTrialState>,
}

impl LocalTrialRecords {
    /// Empty records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot.
    #[must_use]
    pub fn from_state(state: LocalTrialState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current state, for snapshotting.
    #[must_use]
    pub fn state(&self) -> LocalTrialState {
        self.state.read().clone()
    }
}

impl TrialRecords for LocalTrialRecords {
    fn latest_trial_id(&self) -> Result<TrialId> {
        Ok(self.state.read().trial_id)
    }

    fn allocate(&self) -> Result<TrialId> {
        let mut state = self.state.write();
        state.trial_id += 1;
        Ok(state.trial_id)
    }

    fn save_parameters(&self, trial_id: TrialId, params: &ParameterSnapshot) -> Result<()> {
        self.state.write().parameters.insert(trial_id, params.clone());
        Ok(())
    }

    fn load_parameters(&self, trial_id: TrialId) -> Result<ParameterSnapshot> {
        self.state
            .read()
            .parameters
            .get(&trial_id)
            .cloned()
            .ok_or_else(|| Error::trial_not_found(trial_id))
    }

    fn save_result(&self, trial_id: TrialId, result: &TrialResult) -> Result<()> {
        self.state.write().results.insert(trial_id, result.clone());
        Ok(())
    }

    fn load_result(&self, trial_id: TrialId) -> Result<TrialResult> {
        self.state
            .read()
            .results
            .get(&trial_id)
            .cloned()
            .ok_or_else(|| Error::trial_not_found(trial_id))
    }

    fn parameter_history(&self) -> Result<BTreeMap<TrialId, ParameterSnapshot>> {
        Ok(self.state.read().parameters.clone())
    }

    fn result_history(&self) -> Result<BTreeMap<TrialId, TrialResult>> {
        Ok(self.state.read().results.clone())
    }

    fn update_step_hash(&self, input_key: &str, output_hash: &str) -> Result<String> {
        let previous = self
            .state
            .write()
            .hashes
            .insert(input_key.to_string(), output_hash.to_string());
        Ok(previous.unwrap_or_else(|| output_hash.to_string()))
    }
}

/// Backend-resident realization.
#[derive(Debug, Clone)]
pub struct SharedTrialRecords {
    storage: Storage,
}

impl SharedTrialRecords {
    /// Accessor over `storage`.
    #[must_use]
    pub const fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn history<T: serde::de::DeserializeOwned>(&self, pattern: &Key) -> Result<BTreeMap<TrialId, T>> {
        let mut out = BTreeMap::new();
        for key in self.storage.keys(pattern)? {
            if let Some(trial_id) = key.trial_id() {
                out.insert(trial_id, self.storage.load_object(&key)?);
            }
        }
        Ok(out)
    }
}

impl TrialRecords for SharedTrialRecords {
    fn latest_trial_id(&self) -> Result<TrialId> {
        let key = self.storage.trial_counter_key();
        match self.storage.get(&key)? {
            None => Ok(0),
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse()
                .map_err(|e| Error::StorageError(format!("Corrupt trial counter {key}: {e}"))),
        }
    }

    fn allocate(&self) -> Result<TrialId> {
        self.storage.increment(&self.storage.trial_counter_key())
    }

    fn save_parameters(&self, trial_id: TrialId, params: &ParameterSnapshot) -> Result<()> {
        self.storage
            .save_object(&self.storage.parameter_key(trial_id), params)
    }

    fn load_parameters(&self, trial_id: TrialId) -> Result<ParameterSnapshot> {
        self.storage
            .load_object(&self.storage.parameter_key(trial_id))
            .map_err(|e| e.for_trial(trial_id))
    }

    fn save_result(&self, trial_id: TrialId, result: &TrialResult) -> Result<()> {
        self.storage
            .save_object(&self.storage.history_key(trial_id), result)
    }

    fn load_result(&self, trial_id: TrialId) -> Result<TrialResult> {
        self.storage
            .load_object(&self.storage.history_key(trial_id))
            .map_err(|e| e.for_trial(trial_id))
    }

    fn parameter_history(&self) -> Result<BTreeMap<TrialId, ParameterSnapshot>> {
        self.history(&Key::parameter(self.storage.experiment_id(), Segment::Wildcard))
    }

    fn result_history(&self) -> Result<BTreeMap<TrialId, TrialResult>> {
        self.history(&Key::history(self.storage.experiment_id(), Segment::Wildcard))
    }

    fn update_step_hash(&self, input_key: &str, output_hash: &str) -> Result<String> {
        let key = self.storage.step_hash_key(input_key);
        let previous = match self.storage.load_text(&key) {
            Ok(previous) => previous,
            Err(Error::RecordNotFound(_)) => output_hash.to_string(),
            Err(e) => return Err(e),
        };
        self.storage.save_text(&key, output_hash)?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::Utc;
    use serde_json::json;

    fn realizations() -> Vec<Box<dyn TrialRecords>> {
        vec![
            Box::new(LocalTrialRecords::new()),
            Box::new(SharedTrialRecords::new(Storage::new(MemoryBackend::new("exp")))),
        ]
    }

    #[test]
    fn test_allocate_is_monotonic() {
        for records in realizations() {
            assert_eq!(records.latest_trial_id().unwrap(), 0);
            assert_eq!(records.allocate().unwrap(), 1);
            assert_eq!(records.allocate().unwrap(), 2);
            assert_eq!(records.latest_trial_id().unwrap(), 2);
        }
    }

    #[test]
    fn test_missing_records_are_trial_not_found() {
        for records in realizations() {
            let err = records.load_parameters(4).unwrap_err();
            assert!(matches!(err, Error::TrialNotFound(_)), "{records:?}: {err}");
            assert_eq!(err.to_string(), "Unable to find trial id: 4");

            let err = records.load_result(4).unwrap_err();
            assert!(matches!(err, Error::TrialNotFound(_)));
        }
    }

    #[test]
    fn test_histories() {
        for records in realizations() {
            let params: ParameterSnapshot = [("a".to_string(), json!(1))].into();
            records.save_parameters(1, &params).unwrap();
            records
                .save_result(1, &TrialResult::success(json!(2), Utc::now(), 0))
                .unwrap();
            records
                .save_result(2, &TrialResult::failure("E(x)", Utc::now(), 0))
                .unwrap();

            let parameters = records.parameter_history().unwrap();
            assert_eq!(parameters.keys().copied().collect::<Vec<_>>(), vec![1]);
            let results = records.result_history().unwrap();
            assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
            assert!(!results[&2].is_success());
        }
    }

    #[test]
    fn test_step_hash_returns_previous() {
        for records in realizations() {
            assert_eq!(records.update_step_hash("f-x", "h1").unwrap(), "h1");
            assert_eq!(records.update_step_hash("f-x", "h2").unwrap(), "h1");
            assert_eq!(records.update_step_hash("f-x", "h2").unwrap(), "h2");
            assert_eq!(records.update_step_hash("f-y", "h9").unwrap(), "h9");
        }
    }

    #[test]
    fn test_local_state_roundtrip() {
        let records = LocalTrialRecords::new();
        records.allocate().unwrap();
        records.update_step_hash("k", "v").unwrap();
        let json = serde_json::to_string(&records.state()).unwrap();
        let state: LocalTrialState = serde_json::from_str(&json).unwrap();
        let restored = LocalTrialRecords::from_state(state);
        assert_eq!(restored.latest_trial_id().unwrap(), 1);
        assert_eq!(restored.state(), records.state());
    }
}
