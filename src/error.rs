//! Error types for trialbook
//!
//! Every missing record surfaces as a trial-id-centric error; substrate I/O
//! failures propagate unmodified.

use std::fmt;

use thiserror::Error;

use crate::TrialId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// What the caller asked for when a trial lookup failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialLookup {
    /// A concrete trial id that does not exist (or whose record is missing).
    Id(TrialId),
    /// Free-form context, used when no trial id is known yet.
    Message(String),
}

impl fmt::Display for TrialLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "Unable to find trial id: {id}"),
            Self::Message(msg) => f.write_str(msg),
        }
    }
}

/// Failure raised by a user step.
///
/// `kind` plays the role of an exception type name: it is what appears
/// before the parenthesised message in a failed trial's description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}({message})")]
pub struct StepError {
    kind: String,
    message: String,
}

impl StepError {
    /// Create a step error with an explicit kind name.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Kind name, e.g. `ZeroDivisionError`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Human readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("Error", format!("{err:#}"))
    }
}

/// trialbook error types
#[derive(Error, Debug)]
pub enum Error {
    /// Assigning or resolving a parameter name that was never declared
    #[error("Parameter is not declared. Use Experiment::parameter to declare: {0}")]
    ParameterNotDeclared(String),

    /// Resolving a declared parameter that still has no value
    #[error("Parameters are not defined. Use Experiment::set_parameters to initialize: {0}")]
    ParameterUndefined(String),

    /// Trial id does not exist, is out of range, or its record is missing
    #[error("{0}")]
    TrialNotFound(TrialLookup),

    /// Trial-id accessor misuse while a trial is (or is not) in flight
    #[error("{0}")]
    LockedTrial(String),

    /// Metric key was never saved for this experiment
    #[error("Unable to find saved metric with specified key: {0}")]
    MetricKeyNotFound(String),

    /// Backend slot is absent. Converted to `TrialNotFound` by callers that
    /// know the trial id (see [`Error::for_trial`]).
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Identifier is empty or contains a separator character
    #[error("{name} is not a valid key: {value:?} ({reason})")]
    InvalidKey {
        /// What the identifier names (e.g. "Metric name")
        name: &'static str,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A user step failed
    #[error(transparent)]
    Step(#[from] StepError),

    /// Parameter expression could not be parsed
    #[error("Parameters must be passed with key=value form: {0}")]
    ParseError(String),

    /// Storage error (snapshot / Parquet export)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object codec error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// MongoDB error
    #[cfg(feature = "mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// `TrialNotFound` for a concrete trial id.
    #[must_use]
    pub const fn trial_not_found(trial_id: TrialId) -> Self {
        Self::TrialNotFound(TrialLookup::Id(trial_id))
    }

    /// Substitute the trial id into a backend "record not found" error.
    ///
    /// Any other error is returned unchanged.
    #[must_use]
    pub fn for_trial(self, trial_id: TrialId) -> Self {
        match self {
            Self::RecordNotFound(_) => Self::trial_not_found(trial_id),
            other => other,
        }
    }

    /// Kind name used in failed-trial descriptions.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ParameterNotDeclared(_) => "ParameterNotDeclared",
            Self::ParameterUndefined(_) => "ParameterUndefined",
            Self::TrialNotFound(_) => "TrialNotFound",
            Self::LockedTrial(_) => "LockedTrial",
            Self::MetricKeyNotFound(_) => "MetricKeyNotFound",
            Self::RecordNotFound(_) => "RecordNotFound",
            Self::InvalidKey { .. } => "InvalidKey",
            Self::Step(step) => step.kind(),
            Self::ParseError(_) => "ParseError",
            Self::StorageError(_) => "StorageError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
            #[cfg(feature = "redis")]
            Self::Redis(_) => "RedisError",
            #[cfg(feature = "mongo")]
            Self::Mongo(_) => "MongoError",
            Self::Arrow(_) => "ArrowError",
            Self::Other(_) => "Error",
        }
    }

    /// `"<Kind>(<message>)"`, the form stored in a failed trial's record.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Step(step) => step.to_string(),
            other => format!("{}({other})", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_trial_substitutes_id() {
        let err = Error::RecordNotFound("exp:code:4".to_string()).for_trial(4);
        assert!(matches!(err, Error::TrialNotFound(TrialLookup::Id(4))));
        assert_eq!(err.to_string(), "Unable to find trial id: 4");
    }

    #[test]
    fn test_for_trial_keeps_other_errors() {
        let err = Error::Other("boom".to_string()).for_trial(4);
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_step_description() {
        let err = Error::from(StepError::new("ZeroDivisionError", "division by zero"));
        assert_eq!(err.kind(), "ZeroDivisionError");
        assert_eq!(err.description(), "ZeroDivisionError(division by zero)");
    }

    #[test]
    fn test_description_of_internal_error() {
        let err = Error::ParameterUndefined("a".to_string());
        assert!(err.description().starts_with("ParameterUndefined(Parameters are not defined"));
    }

    #[test]
    fn test_step_error_from_anyhow() {
        let step = StepError::from(anyhow::anyhow!("bad input"));
        assert_eq!(step.kind(), "Error");
        assert_eq!(step.message(), "bad input");
    }
}
