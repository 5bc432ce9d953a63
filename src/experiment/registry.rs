//! Id-to-experiment handle map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Experiment, ExperimentBuilder};
use crate::Result;

/// Hands out one [`Experiment`] per id.
///
/// The registry is an ordinary value: the caller decides its scope and
/// lifetime (one per process, per test, per service).
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    experiments: Mutex<HashMap<String, Arc<Experiment>>>,
}

impl ExperimentRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered experiment for the builder's id, or a new one built
    /// from `builder`. The builder is ignored when the id is known.
    ///
    /// # Errors
    /// Errors of [`ExperimentBuilder::build`].
    pub fn get_or_create(&self, builder: ExperimentBuilder) -> Result<Arc<Experiment>> {
        let mut experiments = self.experiments.lock();
        if let Some(existing) = experiments.get(builder.id()) {
            tracing::debug!(experiment = builder.id(), "Reusing registered experiment");
            return Ok(Arc::clone(existing));
        }
        let experiment = builder.build()?;
        experiments.insert(experiment.id().to_string(), Arc::clone(&experiment));
        Ok(experiment)
    }

    /// Registered experiment for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Experiment>> {
        self.experiments.lock().get(id).cloned()
    }

    /// Forget `id`. Existing handles stay usable.
    pub fn remove(&self, id: &str) -> Option<Arc<Experiment>> {
        self.experiments.lock().remove(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.experiments.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.lock().len()
    }

    /// Check if no experiment is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.lock().is_empty()
    }
}
