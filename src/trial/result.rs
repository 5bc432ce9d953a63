//! Trial result record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{value_type, Value};

/// Outcome of one trial.
///
/// Immutable once built; a finished trial's record is never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    result: Value,
    result_type: String,
    success: bool,
    finished: DateTime<Utc>,
    process_time: Duration,
    description: Option<String>,
    seed: u32,
}

impl TrialResult {
    /// Record of a successful trial finishing now.
    #[must_use]
    pub fn success(result: Value, started: DateTime<Utc>, seed: u32) -> Self {
        Self::builder(seed).started(started).result(result).build()
    }

    /// Record of a failed trial finishing now. The result is cleared.
    #[must_use]
    pub fn failure(description: impl Into<String>, started: DateTime<Utc>, seed: u32) -> Self {
        Self::builder(seed)
            .started(started)
            .description(description)
            .build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder(seed: u32) -> TrialResultBuilder {
        TrialResultBuilder::new(seed)
    }

    /// Step output (`null` for failed trials).
    #[must_use]
    pub const fn result(&self) -> &Value {
        &self.result
    }

    /// Type tag of the result (see [`crate::value_type`]).
    #[must_use]
    pub fn result_type(&self) -> &str {
        &self.result_type
    }

    /// Whether the terminal step returned a value.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.success
    }

    /// Finish timestamp.
    #[must_use]
    pub const fn finished(&self) -> DateTime<Utc> {
        self.finished
    }

    /// Wall-clock time from trial start to finish.
    #[must_use]
    pub const fn process_time(&self) -> Duration {
        self.process_time
    }

    /// Failure description, `"<Kind>(<message>)"`.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Random seed the trial ran with.
    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.seed
    }
}

impl std::fmt::Display for TrialResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.success { "SUCCEEDED" } else { "FAILED" };
        write!(f, "Result(value={}, {state})", self.result)
    }
}

/// Builder for [`TrialResult`].
#[derive(Debug)]
pub struct TrialResultBuilder {
    seed: u32,
    result: Option<Value>,
    description: Option<String>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}

impl TrialResultBuilder {
    /// Create a builder for a trial run with `seed`.
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self {
            seed,
            result: None,
            description: None,
            started: None,
            finished: None,
        }
    }

    /// Successful output.
    #[must_use]
    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Failure description. Marks the trial failed.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Start timestamp (process time is measured from here).
    #[must_use]
    pub const fn started(mut self, started: DateTime<Utc>) -> Self {
        self.started = Some(started);
        self
    }

    /// Override the finish timestamp (defaults to now).
    #[must_use]
    pub const fn finished(mut self, finished: DateTime<Utc>) -> Self {
        self.finished = Some(finished);
        self
    }

    /// Build the record.
    #[must_use]
    pub fn build(self) -> TrialResult {
        let finished = self.finished.unwrap_or_else(Utc::now);
        let started = self.started.unwrap_or(finished);
        let process_time = (finished - started).to_std().unwrap_or_default();
        let success = self.description.is_none();
        let result = if success {
            self.result.unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        TrialResult {
            result_type: value_type(&result).to_string(),
            result,
            success,
            finished,
            process_time,
            description: self.description,
            seed: self.seed,
        }
    }
}
