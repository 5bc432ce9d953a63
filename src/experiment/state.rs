//! Whole-experiment snapshot of the local backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metric::LocalMetricState;
use crate::trial::LocalTrialState;

/// Everything the local backend keeps in process memory between trials.
///
/// Locks and connections are never part of it: a restored experiment is
/// always unlocked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    /// Trial counter, parameter / result history and step fingerprints
    pub trials: LocalTrialState,
    /// Metric series
    pub metrics: LocalMetricState,
    /// Last source text seen per step
    #[serde(default)]
    pub code: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_code_defaults() {
        let json = r#"{"trials":{"trial_id":2,"parameters":{},"results":{},"hashes":{}},"metrics":{"series":{}}}"#;
        let state: ExperimentState = serde_json::from_str(json).unwrap();
        assert_eq!(state.trials.trial_id, 2);
        assert!(state.code.is_empty());
    }
}
