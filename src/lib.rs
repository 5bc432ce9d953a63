//! # trialbook: experiment tracking over a lazy step graph
//!
//! trialbook wraps user-defined computation steps in a lazy graph, assigns
//! every execution of the terminal step a monotonically increasing trial id,
//! and records what went into and came out of it: parameters, result,
//! metrics, step source text, and environment snapshots. Records live in a
//! pluggable backend (local filesystem, Redis, MongoDB, or in-process
//! memory).
//!
//! ## Design
//!
//! - **One trial in flight**: trial-id allocation and the
//!   start-to-finish window are guarded by a non-reentrant lock per
//!   experiment. Reading the "safe" [`Experiment::trial_id`] while a trial
//!   runs is an error; steps use [`Experiment::current_trial_id`].
//! - **Failures are history**: a failing step is recorded as a failed trial
//!   before the error is returned to the caller.
//! - **Uniform storage**: every substrate implements the same byte-level
//!   [`backend::Backend`] contract; [`backend::Storage`] adds the codec.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use trialbook::{Experiment, StepError};
//!
//! # fn main() -> trialbook::Result<()> {
//! let exp = Experiment::builder("quickstart").backend("memory://").build()?;
//! let a = exp.parameter("a", None)?;
//!
//! let inc = exp.result("inc", |args| {
//!     let a = args[0].as_i64().ok_or_else(|| StepError::new("TypeError", "a"))?;
//!     Ok(json!(a + 1))
//! });
//!
//! exp.set_parameters([("a", json!(1))])?;
//! assert_eq!(inc.call([a.node()]).compute()?, json!(2));
//! assert_eq!(exp.trial_id()?, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod backend;
pub mod code;
pub mod config;
pub mod diff;
pub mod environment;
pub mod error;
pub mod experiment;
pub mod export;
pub mod fingerprint;
pub mod graph;
pub mod key;
pub mod log;
pub mod metric;
pub mod parameter;
pub mod parser;
pub mod trial;

pub use error::{Error, Result, StepError, TrialLookup};
pub use experiment::{
    Experiment, ExperimentBuilder, ExperimentRegistry, ResultHandle, ResultNode, StepHandle,
};
pub use graph::{Executor, Node, Sequential, StepOutput};
pub use metric::{MetricRecord, MetricTable};
pub use parameter::{ParamValue, Parameter};
pub use trial::{History, TrialResult};

/// Trial identifier. `0` means "no trial yet"; the first trial is `1`.
pub type TrialId = u64;

/// Dynamically-typed value flowing between steps and into records.
pub type Value = serde_json::Value;

/// Short type tag of a value, used in result records and descriptions.
#[must_use]
pub fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_type() {
        assert_eq!(value_type(&json!(null)), "null");
        assert_eq!(value_type(&json!(1)), "integer");
        assert_eq!(value_type(&json!(-1)), "integer");
        assert_eq!(value_type(&json!(1.5)), "float");
        assert_eq!(value_type(&json!("x")), "string");
        assert_eq!(value_type(&json!([1])), "array");
        assert_eq!(value_type(&json!({"a": 1})), "object");
    }
}
