//! Declared parameters.
//!
//! A parameter is declared once by name and resolved lazily when the graph
//! executes. Until a value is assigned it holds [`ParamValue::Undefined`],
//! which is distinct from a JSON `null`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::trial::{RESULT_COLUMNS, TRIAL_ID_COLUMN};
use crate::{value_type, Error, Result, Value};

/// Current value of a declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Declared but never assigned
    Undefined,
    /// Concrete value (may be `null`)
    Value(Value),
}

impl ParamValue {
    /// Whether a concrete value is present.
    #[must_use]
    pub const fn is_defined(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Concrete value, if any.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Undefined => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Value(v) => write!(f, "{v} ({})", value_type(v)),
        }
    }
}

/// Registry of declared parameters for one experiment.
#[derive(Debug, Default)]
pub struct ParameterManager {
    params: RwLock<BTreeMap<String, ParamValue>>,
}

impl ParameterManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name`, optionally with a default value.
    ///
    /// Idempotent: declaring an existing name leaves its value untouched and
    /// returns a handle to it.
    ///
    /// # Errors
    /// `InvalidKey` if `name` is empty or is a history column name
    /// (`Trial ID`, `Seed`, `Result`, ...).
    pub fn define(self: &Arc<Self>, name: &str, default: Option<Value>) -> Result<Parameter> {
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name == TRIAL_ID_COLUMN || RESULT_COLUMNS.contains(&name) {
            Some("collides with a history column")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(Error::InvalidKey {
                name: "Parameter name",
                value: name.to_string(),
                reason,
            });
        }

        let mut params = self.params.write();
        if params.contains_key(name) {
            tracing::debug!(parameter = name, "re-defining existing parameter");
        } else {
            let value = default.map_or(ParamValue::Undefined, ParamValue::Value);
            params.insert(name.to_string(), value);
        }
        Ok(Parameter {
            name: name.to_string(),
            manager: Arc::clone(self),
        })
    }

    /// Assign values to already-declared names.
    ///
    /// Either every assignment is applied or none is.
    ///
    /// # Errors
    /// `ParameterNotDeclared` naming the first unknown parameter.
    pub fn set<I, K>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: Vec<(String, Value)> = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let mut params = self.params.write();
        if let Some((name, _)) = values.iter().find(|(name, _)| !params.contains_key(name)) {
            return Err(Error::ParameterNotDeclared(name.clone()));
        }
        for (name, value) in values {
            params.insert(name, ParamValue::Value(value));
        }
        drop(params);
        tracing::info!("Updated parameters: {}", self.describe());
        Ok(())
    }

    /// Resolve one parameter to its concrete value.
    ///
    /// # Errors
    /// `ParameterNotDeclared` or `ParameterUndefined`.
    pub fn resolve(&self, name: &str) -> Result<Value> {
        match self.params.read().get(name) {
            None => Err(Error::ParameterNotDeclared(name.to_string())),
            Some(ParamValue::Undefined) => Err(Error::ParameterUndefined(name.to_string())),
            Some(ParamValue::Value(v)) => Ok(v.clone()),
        }
    }

    /// Pre-flight gate: every declared parameter must hold a value.
    ///
    /// # Errors
    /// `ParameterUndefined` listing all undefined names, comma separated.
    pub fn check_all_defined(&self) -> Result<()> {
        let params = self.params.read();
        let undefined: Vec<&str> = params
            .iter()
            .filter(|(_, v)| !v.is_defined())
            .map(|(k, _)| k.as_str())
            .collect();
        if undefined.is_empty() {
            Ok(())
        } else {
            Err(Error::ParameterUndefined(undefined.join(", ")))
        }
    }

    /// Snapshot of the concrete values; undefined entries are dropped.
    #[must_use]
    pub fn to_dict(&self) -> BTreeMap<String, Value> {
        self.params
            .read()
            .iter()
            .filter_map(|(k, v)| v.as_value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Snapshot including undefined entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ParamValue> {
        self.params.read().clone()
    }

    /// Declared names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.params.read().keys().cloned().collect()
    }

    /// Human-readable listing, e.g. `a=1 (integer), b=Undefined`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.params
            .read()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Handle to a declared parameter, usable as a graph leaf.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    manager: Arc<ParameterManager>,
}

impl Parameter {
    /// Parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    ///
    /// # Errors
    /// `ParameterUndefined` if no value has been assigned.
    pub fn resolve(&self) -> Result<Value> {
        self.manager.resolve(&self.name)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self
            .manager
            .snapshot()
            .remove(&self.name)
            .unwrap_or(ParamValue::Undefined);
        write!(f, "Parameter({}: {value})", self.name)
    }
}
