//! Logical backend keys
//!
//! Managers derive a [`Key`] deterministically from
//! (experiment id, category, sub-key, trial id); each backend renders it to
//! its native addressing form (file path, colon-joined string, document
//! selector) and parses native keys back during wildcard enumeration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, TrialId};

/// Logical record category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// The experiment's trial-id counter.
    TrialId,
    /// Parameter snapshot of a trial.
    Parameter,
    /// Result record of a trial.
    History,
    /// Metric series of `(metric, trial)`.
    Metric,
    /// Persisted step output of `(step, trial)`.
    Persist,
    /// Code snapshot of a trial.
    Code,
    /// Environment snapshot of `(collector, trial)`.
    Environment,
    /// Last output fingerprint of `(step, input fingerprint)`.
    StepHash,
}

impl Category {
    /// All categories, in a stable order.
    pub const ALL: [Self; 8] = [
        Self::TrialId,
        Self::Parameter,
        Self::History,
        Self::Metric,
        Self::Persist,
        Self::Code,
        Self::Environment,
        Self::StepHash,
    ];

    /// Name used in native keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrialId => "trial_id",
            Self::Parameter => "parameter",
            Self::History => "history",
            Self::Metric => "metric",
            Self::Persist => "persist",
            Self::Code => "code",
            Self::Environment => "environment",
            Self::StepHash => "step_hash",
        }
    }

    /// Parse a native category name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Whether keys of this category carry a sub-key (metric, step, collector).
    #[must_use]
    pub const fn has_name(self) -> bool {
        matches!(
            self,
            Self::Metric | Self::Persist | Self::Environment | Self::StepHash
        )
    }

    /// Whether keys of this category carry a trial id.
    #[must_use]
    pub const fn has_trial(self) -> bool {
        !matches!(self, Self::TrialId | Self::StepHash)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable key segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Segment<T> {
    /// A concrete value.
    Exact(T),
    /// Matches any value during enumeration.
    Wildcard,
}

impl<T> Segment<T> {
    /// Concrete value, if any.
    pub const fn exact(&self) -> Option<&T> {
        match self {
            Self::Exact(v) => Some(v),
            Self::Wildcard => None,
        }
    }

    /// Whether this segment is a wildcard.
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }
}

/// A logical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    experiment_id: String,
    category: Category,
    name: Option<Segment<String>>,
    trial: Option<Segment<TrialId>>,
}

impl Key {
    fn build(
        experiment_id: &str,
        category: Category,
        name: Option<Segment<String>>,
        trial: Option<Segment<TrialId>>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            category,
            name,
            trial,
        }
    }

    /// Assemble a key from already-parsed parts, checking arity.
    pub(crate) fn from_parts(
        experiment_id: &str,
        category: Category,
        name: Option<String>,
        trial: Option<TrialId>,
    ) -> Option<Self> {
        if category.has_name() != name.is_some() || category.has_trial() != trial.is_some() {
            return None;
        }
        Some(Self::build(
            experiment_id,
            category,
            name.map(Segment::Exact),
            trial.map(Segment::Exact),
        ))
    }

    /// Trial-id counter key.
    #[must_use]
    pub fn trial_counter(experiment_id: &str) -> Self {
        Self::build(experiment_id, Category::TrialId, None, None)
    }

    /// Parameter snapshot key.
    #[must_use]
    pub fn parameter(experiment_id: &str, trial: Segment<TrialId>) -> Self {
        Self::build(experiment_id, Category::Parameter, None, Some(trial))
    }

    /// Result record key.
    #[must_use]
    pub fn history(experiment_id: &str, trial: Segment<TrialId>) -> Self {
        Self::build(experiment_id, Category::History, None, Some(trial))
    }

    /// Metric series key.
    #[must_use]
    pub fn metric(experiment_id: &str, metric: Segment<String>, trial: Segment<TrialId>) -> Self {
        Self::build(experiment_id, Category::Metric, Some(metric), Some(trial))
    }

    /// Persisted step output key.
    #[must_use]
    pub fn persist(experiment_id: &str, step: &str, trial: Segment<TrialId>) -> Self {
        Self::build(
            experiment_id,
            Category::Persist,
            Some(Segment::Exact(step.to_string())),
            Some(trial),
        )
    }

    /// Code snapshot key.
    #[must_use]
    pub fn code(experiment_id: &str, trial: Segment<TrialId>) -> Self {
        Self::build(experiment_id, Category::Code, None, Some(trial))
    }

    /// Environment snapshot key for one collector.
    #[must_use]
    pub fn environment(experiment_id: &str, collector: &str, trial: Segment<TrialId>) -> Self {
        Self::build(
            experiment_id,
            Category::Environment,
            Some(Segment::Exact(collector.to_string())),
            Some(trial),
        )
    }

    /// Step fingerprint key.
    #[must_use]
    pub fn step_hash(experiment_id: &str, input_key: &str) -> Self {
        Self::build(
            experiment_id,
            Category::StepHash,
            Some(Segment::Exact(input_key.to_string())),
            None,
        )
    }

    /// Owning experiment id.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Record category.
    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    /// Sub-key segment (metric / step / collector / input fingerprint).
    #[must_use]
    pub const fn name(&self) -> Option<&Segment<String>> {
        self.name.as_ref()
    }

    /// Trial segment.
    #[must_use]
    pub const fn trial(&self) -> Option<&Segment<TrialId>> {
        self.trial.as_ref()
    }

    /// Concrete sub-key, if not wildcarded.
    #[must_use]
    pub fn name_str(&self) -> Option<&str> {
        self.name.as_ref().and_then(Segment::exact).map(String::as_str)
    }

    /// Concrete trial id, if not wildcarded.
    #[must_use]
    pub fn trial_id(&self) -> Option<TrialId> {
        self.trial.as_ref().and_then(Segment::exact).copied()
    }

    /// Whether any segment is a wildcard.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.name.as_ref().is_some_and(Segment::is_wildcard)
            || self.trial.as_ref().is_some_and(Segment::is_wildcard)
    }

    /// Whether a concrete key matches this (possibly wildcarded) pattern.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        fn seg<T: PartialEq>(p: Option<&Segment<T>>, v: Option<&Segment<T>>) -> bool {
            match (p, v) {
                (None, None) | (Some(Segment::Wildcard), Some(_)) => true,
                (Some(Segment::Exact(a)), Some(Segment::Exact(b))) => a == b,
                _ => false,
            }
        }
        self.experiment_id == other.experiment_id
            && self.category == other.category
            && seg(self.name.as_ref(), other.name.as_ref())
            && seg(self.trial.as_ref(), other.trial.as_ref())
    }

    /// Colon-joined form, e.g. `myexp:metric:loss:3` (`*` for wildcards).
    #[must_use]
    pub fn to_colon_string(&self) -> String {
        let mut parts = vec![self.experiment_id.clone(), self.category.as_str().to_string()];
        if let Some(name) = &self.name {
            parts.push(match name {
                Segment::Exact(v) => v.clone(),
                Segment::Wildcard => "*".to_string(),
            });
        }
        if let Some(trial) = &self.trial {
            parts.push(match trial {
                Segment::Exact(v) => v.to_string(),
                Segment::Wildcard => "*".to_string(),
            });
        }
        parts.join(":")
    }

    /// Parse the colon-joined form back into a concrete key.
    ///
    /// Returns `None` for foreign keys (other experiments, unknown layouts).
    #[must_use]
    pub fn parse_colon(experiment_id: &str, text: &str) -> Option<Self> {
        let rest = text.strip_prefix(experiment_id)?.strip_prefix(':')?;
        let mut parts = rest.split(':');
        let category = Category::from_name(parts.next()?)?;
        let name = if category.has_name() {
            Some(parts.next()?.to_string())
        } else {
            None
        };
        let trial = if category.has_trial() {
            Some(parts.next()?.parse().ok()?)
        } else {
            None
        };
        if parts.next().is_some() {
            return None;
        }
        Self::from_parts(experiment_id, category, name, trial)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

/// Validate an identifier used inside keys (experiment id, metric name, step
/// name, collector name).
///
/// # Errors
///
/// `InvalidKey` if the value is empty or contains a namespace (`:`), path
/// (`/`, `\`), or glob (`*`, `?`, `[`, `]`) character.
pub fn validate_key(value: &str, name: &'static str) -> Result<()> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains(':') {
        Some("cannot contain colon (:)")
    } else if value.contains('/') || value.contains('\\') {
        Some("cannot contain path separators")
    } else if value.contains(['*', '?', '[', ']']) {
        Some("cannot contain glob characters (*, ?, [, ])")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidKey {
            name,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
