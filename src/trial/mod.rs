//! Trial lifecycle bookkeeping.
//!
//! [`TrialManager`] owns the trial-id counter (through a [`TrialRecords`]
//! realization), the single-trial lock, and the purity check.
//!
//! ```text
//! UNLOCKED ──start_trial()──▶ LOCKED ──finish_trial() / guard drop──▶ UNLOCKED
//!   trial_id() ok                current_trial_id() ok
//!   current_trial_id() err       trial_id() err
//! ```
//!
//! The lock is process-local. Against a shared store, separate processes
//! each get a distinct id from the backend's atomic counter and may run
//! concurrently; nothing here provides cross-process exclusion.

mod history;
mod records;
mod result;

pub use history::{History, HistoryRow, RESULT_COLUMNS, TRIAL_ID_COLUMN};
pub use records::{
    LocalTrialRecords, LocalTrialState, ParameterSnapshot, SharedTrialRecords, TrialRecords,
};
pub use result::{TrialResult, TrialResultBuilder};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::TrialLookup;
use crate::fingerprint::fingerprint;
use crate::{Error, Result, TrialId, Value};

const TRIAL_ID_WHILE_LOCKED: &str =
    "Unable to use trial_id during trial. Use current_trial_id for safety.";
const NO_CURRENT_TRIAL: &str = "Current Trial ID only exists during a trial execution";

#[derive(Debug, Clone, Copy)]
struct ActiveTrial {
    trial_id: TrialId,
    started: DateTime<Utc>,
}

/// Trial-id allocation, lock, history and purity check for one experiment.
pub struct TrialManager {
    records: Arc<dyn TrialRecords>,
    active: Mutex<Option<ActiveTrial>>,
}

impl fmt::Debug for TrialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialManager")
            .field("records", &self.records)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl TrialManager {
    /// Manage trials stored in `records`. Always starts unlocked.
    #[must_use]
    pub fn new(records: Arc<dyn TrialRecords>) -> Self {
        Self {
            records,
            active: Mutex::new(None),
        }
    }

    /// Underlying records.
    #[must_use]
    pub fn records(&self) -> &dyn TrialRecords {
        self.records.as_ref()
    }

    /// Whether a trial is in flight.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Latest trial id. Only legal outside a trial.
    ///
    /// # Errors
    /// `LockedTrial` while a trial is in flight.
    pub fn trial_id(&self) -> Result<TrialId> {
        if self.is_locked() {
            return Err(Error::LockedTrial(TRIAL_ID_WHILE_LOCKED.to_string()));
        }
        self.records.latest_trial_id()
    }

    /// Latest trial id regardless of the lock, for range checks.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn latest_trial_id(&self) -> Result<TrialId> {
        self.records.latest_trial_id()
    }

    /// Id of the trial in flight.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial.
    pub fn current_trial_id(&self) -> Result<TrialId> {
        (*self.active.lock())
            .map(|a| a.trial_id)
            .ok_or_else(|| Error::TrialNotFound(TrialLookup::Message(NO_CURRENT_TRIAL.to_string())))
    }

    /// Start timestamp of the trial in flight.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        (*self.active.lock()).map(|a| a.started)
    }

    /// Lock and allocate the next trial id.
    ///
    /// # Errors
    /// `LockedTrial` if a trial is already in flight (the counter does not
    /// advance); substrate errors from the counter.
    pub fn increment(&self) -> Result<TrialId> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            return Err(Error::LockedTrial(format!(
                "Another trial is already running (trial id={})",
                current.trial_id
            )));
        }
        let trial_id = self.records.allocate()?;
        *active = Some(ActiveTrial {
            trial_id,
            started: Utc::now(),
        });
        Ok(trial_id)
    }

    /// Allocate a trial id and return a guard that unlocks when dropped.
    ///
    /// # Errors
    /// See [`TrialManager::increment`].
    pub fn start_trial(&self) -> Result<TrialGuard<'_>> {
        let trial_id = self.increment()?;
        tracing::info!(trial_id, "Started trial");
        Ok(TrialGuard {
            manager: self,
            trial_id,
        })
    }

    /// Release the lock. A no-op when unlocked.
    pub fn unlock(&self) {
        self.active.lock().take();
    }

    /// Persist the parameter snapshot of the trial in flight.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial; substrate errors.
    pub fn save_parameters(&self, params: &ParameterSnapshot) -> Result<()> {
        let trial_id = self.current_trial_id()?;
        self.records.save_parameters(trial_id, params)
    }

    /// Parameter snapshot of a past trial.
    ///
    /// # Errors
    /// `TrialNotFound` when absent.
    pub fn load_parameters(&self, trial_id: TrialId) -> Result<ParameterSnapshot> {
        self.records.load_parameters(trial_id)
    }

    /// Result record of a past trial.
    ///
    /// # Errors
    /// `TrialNotFound` when absent.
    pub fn load_result(&self, trial_id: TrialId) -> Result<TrialResult> {
        self.records.load_result(trial_id)
    }

    /// Record the outcome of the trial in flight.
    ///
    /// `outcome` is the terminal value, or the failure description
    /// (`"<Kind>(<message>)"`). The lock is not released here; that is the
    /// guard's job, after the caller has persisted its own state.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial; substrate errors.
    pub fn finish_trial(
        &self,
        outcome: std::result::Result<&Value, &str>,
        seed: u32,
    ) -> Result<TrialResult> {
        let active = (*self.active.lock())
            .ok_or_else(|| Error::TrialNotFound(TrialLookup::Message(NO_CURRENT_TRIAL.to_string())))?;
        let builder = TrialResult::builder(seed).started(active.started);
        let record = match outcome {
            Ok(value) => builder.result(value.clone()).build(),
            Err(description) => builder.description(description).build(),
        };
        self.records.save_result(active.trial_id, &record)?;
        tracing::info!(
            trial_id = active.trial_id,
            success = record.is_success(),
            "Finished trial"
        );
        Ok(record)
    }

    /// Join parameter and result history.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn get_history(&self) -> Result<History> {
        Ok(History::join(
            self.records.parameter_history()?,
            self.records.result_history()?,
        ))
    }

    /// Advisory check that `step` returns the same output for the same
    /// inputs as last time.
    ///
    /// The stored fingerprint is always replaced by the current one, so the
    /// comparison is against the immediately preceding output only. A
    /// mismatch is logged, never raised.
    ///
    /// # Errors
    /// Fingerprint encoding or substrate errors.
    pub fn maybe_pure<I, O>(&self, step: &str, inputs: &I, output: &O) -> Result<bool>
    where
        I: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        let input_hash = fingerprint(inputs)?;
        let output_hash = fingerprint(output)?;
        let input_key = format!("{step}-{input_hash}");

        let previous = self.records.update_step_hash(&input_key, &output_hash)?;
        let pure = previous == output_hash;
        if !pure {
            let inputs = serde_json::to_string(inputs).unwrap_or_default();
            tracing::warn!(
                step,
                inputs = %inputs,
                "Experiment step result is changed with the same input"
            );
        }
        Ok(pure)
    }
}

/// Holds the trial lock; unlocks on drop.
#[must_use = "dropping the guard ends the trial"]
pub struct TrialGuard<'a> {
    manager: &'a TrialManager,
    trial_id: TrialId,
}

impl TrialGuard<'_> {
    /// Id of the guarded trial.
    #[must_use]
    pub const fn trial_id(&self) -> TrialId {
        self.trial_id
    }
}

impl fmt::Debug for TrialGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrialGuard").field(&self.trial_id).finish()
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock();
    }
}
