//! Experiment construction.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::state::ExperimentState;
use super::Experiment;
use crate::backend::{open_backend, Backend, Storage};
use crate::code::CodeManager;
use crate::config::{resolve_cache_root, BackendSpec};
use crate::environment::{Collector, EnvironmentManager, Snapshot};
use crate::graph::{Executor, Sequential};
use crate::key::validate_key;
use crate::metric::{LocalMetricStore, MetricManager, MetricStore, SharedMetricStore};
use crate::parameter::ParameterManager;
use crate::trial::{LocalTrialRecords, SharedTrialRecords, TrialManager, TrialRecords};
use crate::{Error, Result};

/// Experiment builder
pub struct ExperimentBuilder {
    id: String,
    backend: BackendSpec,
    backend_instance: Option<Arc<dyn Backend>>,
    seed: Option<u32>,
    cache_root: Option<PathBuf>,
    executor: Option<Arc<dyn Executor>>,
    environment: Option<Vec<(Collector, Snapshot)>>,
}

impl fmt::Debug for ExperimentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentBuilder")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("backend_instance", &self.backend_instance)
            .field("seed", &self.seed)
            .field("cache_root", &self.cache_root)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ExperimentBuilder {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: BackendSpec::default(),
            backend_instance: None,
            seed: None,
            cache_root: None,
            executor: None,
            environment: None,
        }
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Select the backend (`"redis://..."`, `"mongodb://..."`, `"memory://"`,
    /// or a filesystem path).
    #[must_use]
    pub fn backend(mut self, backend: impl Into<BackendSpec>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Use an already-constructed backend. It must be bound to the same
    /// experiment id.
    #[must_use]
    pub fn backend_instance(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend_instance = Some(backend);
        self
    }

    /// Default seed for trials computed without an explicit one.
    #[must_use]
    pub const fn seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Root directory of the local backend.
    #[must_use]
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Graph executor (defaults to [`Sequential`]).
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use fixed environment snapshots instead of collecting them.
    #[must_use]
    pub fn environment(mut self, snapshots: Vec<(Collector, Snapshot)>) -> Self {
        self.environment = Some(snapshots);
        self
    }

    /// Open the backend, restore any saved state and build the experiment.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the id is empty or contains a separator
    /// - `Other` if a supplied backend is bound to another experiment
    /// - backend and snapshot decoding errors
    pub fn build(self) -> Result<Arc<Experiment>> {
        validate_key(&self.id, "Experiment id")?;

        let backend = match self.backend_instance {
            Some(backend) if backend.experiment_id() != self.id => {
                return Err(Error::Other(format!(
                    "Backend is bound to experiment {}, not {}",
                    backend.experiment_id(),
                    self.id
                )))
            }
            Some(backend) => backend,
            None => open_backend(&self.id, &self.backend, &resolve_cache_root(self.cache_root))?,
        };
        let storage = Storage::from_arc(backend);

        let state: Option<ExperimentState> = if storage.kind().is_shared_store() {
            None
        } else {
            storage
                .backend()
                .load_state()?
                .map(|bytes| serde_json::from_slice(&bytes))
                .transpose()?
        };

        let (records, metric_store, local, code_history): (
            Arc<dyn TrialRecords>,
            Arc<dyn MetricStore>,
            _,
            _,
        ) = if storage.kind().is_shared_store() {
            (
                Arc::new(SharedTrialRecords::new(storage.clone())),
                Arc::new(SharedMetricStore::new(storage.clone())),
                None,
                Default::default(),
            )
        } else {
            let state = state.unwrap_or_default();
            let trials = Arc::new(LocalTrialRecords::from_state(state.trials));
            let metrics = Arc::new(LocalMetricStore::from_state(state.metrics));
            (
                trials.clone(),
                metrics.clone(),
                Some((trials, metrics)),
                state.code,
            )
        };

        let environment = match self.environment {
            Some(snapshots) => EnvironmentManager::with_snapshots(storage.clone(), snapshots),
            None => EnvironmentManager::new(storage.clone()),
        };

        let experiment = Arc::new(Experiment {
            id: self.id,
            parameters: Arc::new(ParameterManager::new()),
            trials: TrialManager::new(records),
            metrics: MetricManager::new(metric_store),
            code: CodeManager::with_history(storage.clone(), code_history),
            environment,
            executor: self.executor.unwrap_or_else(|| Arc::new(Sequential)),
            default_seed: self.seed,
            local,
            seed: Mutex::new(None),
            storage,
        });

        let latest = experiment.trials.latest_trial_id()?;
        if latest > 0 {
            tracing::info!("Loaded existing experiment: {experiment}");
        } else {
            tracing::info!("Initialized new experiment: {experiment}");
        }

        experiment.environment.log_environment_info();
        if latest > 0 {
            experiment.environment.check_environment_change(latest)?;
        }
        Ok(experiment)
    }
}
