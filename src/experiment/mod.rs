//! Experiment façade and trial lifecycle.
//!
//! An [`Experiment`] composes the parameter registry, trial manager, metric
//! manager, code registry and environment manager over one backend, wraps
//! user functions into graph steps, and drives each trial:
//!
//! ```text
//! IDLE ─▶ PREPARING ─▶ RUNNING ─▶ FINALIZING ─▶ IDLE
//!          │ parameters defined?     │ result or failure recorded
//!          │ allocate + lock id      │ snapshot saved
//!          │ seed, save inputs       │ lock released, error re-raised
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use serde_json::json;
//! use trialbook::{Experiment, StepError};
//!
//! # fn main() -> trialbook::Result<()> {
//! let exp = Experiment::builder("usage_doc").backend("memory://").build()?;
//! let a = exp.parameter("a", None)?;
//! let div = exp.result("div", |args| match args[0].as_i64() {
//!     Some(0) | None => Err(StepError::new("ZeroDivisionError", "division by zero")),
//!     Some(a) => Ok(json!(3.0 / a as f64)),
//! });
//!
//! exp.set_parameters([("a", json!(0))])?;
//! assert!(div.call([&a]).compute().is_err());
//!
//! let history = exp.get_history()?;
//! assert_eq!(history.value(1, "Success"), Some(json!(false)));
//! # Ok(())
//! # }
//! ```

mod builder;
mod handle;
mod registry;
mod state;

pub use builder::ExperimentBuilder;
pub use handle::{ResultHandle, ResultNode, StepHandle};
pub use registry::ExperimentRegistry;
pub use state::ExperimentState;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::Storage;
use crate::code::CodeManager;
use crate::environment::EnvironmentManager;
use crate::graph::{Executor, Node, Step, StepObserver, StepOutput};
use crate::key::validate_key;
use crate::metric::{LocalMetricStore, MetricManager, MetricTable};
use crate::parameter::{Parameter, ParameterManager};
use crate::parser::parse_arguments;
use crate::trial::{History, LocalTrialRecords, TrialManager};
use crate::{Error, Result, TrialId, Value};

/// A named experiment bound to one backend.
pub struct Experiment {
    id: String,
    storage: Storage,
    parameters: Arc<ParameterManager>,
    trials: TrialManager,
    metrics: MetricManager,
    code: CodeManager,
    environment: EnvironmentManager,
    executor: Arc<dyn Executor>,
    default_seed: Option<u32>,
    // in-process records of the local backend, snapshotted after each trial
    local: Option<(Arc<LocalTrialRecords>, Arc<LocalMetricStore>)>,
    // seed of the trial in flight
    seed: Mutex<Option<u32>>,
}

impl Experiment {
    /// Start building an experiment with the given id.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(id)
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Storage the experiment writes through.
    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Graph construction
    // ------------------------------------------------------------------

    /// Declare a parameter (idempotent).
    ///
    /// # Errors
    /// `InvalidKey` for an empty name or a history column name.
    pub fn parameter(&self, name: &str, default: Option<Value>) -> Result<Parameter> {
        self.parameters.define(name, default)
    }

    fn tracked_step<F>(self: &Arc<Self>, name: &str, func: F, persist: bool) -> StepHandle
    where
        F: Fn(&[Value]) -> StepOutput + Send + Sync + 'static,
    {
        let observer: Arc<dyn StepObserver> = Arc::clone(self) as Arc<dyn StepObserver>;
        let mut step = Step::new(name, func).observed(observer);
        if persist {
            step = step.persisted();
        }
        StepHandle::new(Arc::new(step), Arc::clone(self))
    }

    /// Wrap `func` as a tracked intermediate step.
    pub fn step<F>(self: &Arc<Self>, name: &str, func: F) -> StepHandle
    where
        F: Fn(&[Value]) -> StepOutput + Send + Sync + 'static,
    {
        self.tracked_step(name, func, false)
    }

    /// Wrap `func` as a step whose output is saved for every trial
    /// (see [`Experiment::get_persisted`]).
    pub fn persist<F>(self: &Arc<Self>, name: &str, func: F) -> StepHandle
    where
        F: Fn(&[Value]) -> StepOutput + Send + Sync + 'static,
    {
        self.tracked_step(name, func, true)
    }

    /// Wrap `func` as the terminal step; computing it runs a trial.
    pub fn result<F>(self: &Arc<Self>, name: &str, func: F) -> ResultHandle
    where
        F: Fn(&[Value]) -> StepOutput + Send + Sync + 'static,
    {
        ResultHandle::new(self.tracked_step(name, func, false))
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Assign values to declared parameters (all or nothing).
    ///
    /// # Errors
    /// `ParameterNotDeclared` for an unknown name.
    pub fn set_parameters<I, K>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.parameters.set(values)
    }

    /// Assign parameters from `name=value` arguments.
    ///
    /// # Errors
    /// `ParseError` for a malformed argument; `ParameterNotDeclared` for an
    /// unknown name.
    pub fn set_parameters_from_args<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parameters.set(parse_arguments(args)?)
    }

    /// Current concrete parameter values, or the snapshot of `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial.
    pub fn get_parameters(&self, trial_id: Option<TrialId>) -> Result<BTreeMap<String, Value>> {
        match trial_id {
            None => Ok(self.parameters.to_dict()),
            Some(trial_id) => {
                self.check_trial_id(trial_id)?;
                self.trials.load_parameters(trial_id)
            }
        }
    }

    /// `name=value (type)` listing of every declared parameter.
    #[must_use]
    pub fn describe_parameters(&self) -> String {
        self.parameters.describe()
    }

    // ------------------------------------------------------------------
    // Trial lifecycle
    // ------------------------------------------------------------------

    /// Latest trial id. Not readable while a trial runs.
    ///
    /// # Errors
    /// `LockedTrial` during a trial.
    pub fn trial_id(&self) -> Result<TrialId> {
        self.trials.trial_id()
    }

    /// Id of the running trial.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial.
    pub fn current_trial_id(&self) -> Result<TrialId> {
        self.trials.current_trial_id()
    }

    /// Seed of the running trial.
    #[must_use]
    pub fn seed(&self) -> Option<u32> {
        *self.seed.lock()
    }

    /// RNG seeded with the running trial's seed. Two trials run with the same
    /// seed draw the same numbers.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial.
    pub fn seeded_rng(&self) -> Result<StdRng> {
        let seed = self.seed().ok_or_else(|| {
            self.trials
                .current_trial_id()
                .err()
                .unwrap_or_else(|| Error::Other("Trial seed is not set".to_string()))
        })?;
        Ok(StdRng::seed_from_u64(u64::from(seed)))
    }

    fn resolve_seed(&self, seed: Option<u32>) -> u32 {
        if let Some(seed) = seed.or(self.default_seed) {
            tracing::info!("Random seed is initialized with given seed: {seed}");
            return seed;
        }
        let seed = rand::random::<u32>();
        tracing::info!("Random seed is not provided, initialized with generated seed: {seed}");
        seed
    }

    fn save_trial_inputs(&self, trial_id: TrialId) -> Result<()> {
        self.trials.save_parameters(&self.parameters.to_dict())?;
        self.code.save(trial_id)?;
        self.environment.save(trial_id)
    }

    pub(crate) fn run_trial(&self, node: &Node, seed: Option<u32>) -> Result<Value> {
        // fails before an id is consumed
        self.parameters.check_all_defined()?;

        let guard = self.trials.start_trial()?;
        tracing::info!(step = %node.label(), trial_id = guard.trial_id(), "Computing");
        let seed = self.resolve_seed(seed);
        *self.seed.lock() = Some(seed);

        let outcome = self
            .save_trial_inputs(guard.trial_id())
            .and_then(|()| self.executor.execute(node));

        let finished = match &outcome {
            Ok(value) => self.trials.finish_trial(Ok(value), seed),
            Err(e) => {
                let description = e.description();
                tracing::error!("Experiment failed: {description}");
                self.trials.finish_trial(Err(&description), seed)
            }
        };
        *self.seed.lock() = None;
        let saved = finished.and_then(|_| self.save());
        drop(guard);

        saved?;
        outcome
    }

    /// Persist the whole-experiment snapshot (local backend only).
    ///
    /// # Errors
    /// Codec or filesystem errors.
    pub fn save(&self) -> Result<()> {
        let Some((trials, metrics)) = &self.local else {
            return Ok(());
        };
        let state = ExperimentState {
            trials: trials.state(),
            metrics: metrics.state(),
            code: self.code.history(),
        };
        self.storage
            .backend()
            .save_state(&serde_json::to_vec_pretty(&state)?)
    }

    /// Remove everything the backend holds for this experiment. In-process
    /// state is kept; drop the experiment (or remove it from its registry)
    /// to start over.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn delete_cache(&self) -> Result<()> {
        tracing::info!(experiment = %self.id, "Deleting cache");
        self.storage.delete_cache()
    }

    fn check_trial_id(&self, trial_id: TrialId) -> Result<()> {
        if trial_id == 0 || trial_id > self.trials.latest_trial_id()? {
            return Err(Error::trial_not_found(trial_id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Parameter and result history, one row per finished trial.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn get_history(&self) -> Result<History> {
        self.trials.get_history()
    }

    /// Output a persisted step produced in `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial or a missing output.
    pub fn get_persisted(&self, step: &str, trial_id: TrialId) -> Result<Value> {
        self.check_trial_id(trial_id)?;
        self.storage
            .load_object(&self.storage.persist_key(step, trial_id))
            .map_err(|e| e.for_trial(trial_id))
    }

    /// Registered step sources: the current ones, or those saved for
    /// `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial.
    pub fn get_code(&self, trial_id: Option<TrialId>) -> Result<String> {
        match trial_id {
            None => Ok(self.code.describe()),
            Some(trial_id) => {
                self.check_trial_id(trial_id)?;
                self.code.load(trial_id)
            }
        }
    }

    /// Platform, build and git summary lines.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial.
    pub fn get_environment(&self, trial_id: Option<TrialId>) -> Result<Vec<String>> {
        if let Some(trial_id) = trial_id {
            self.check_trial_id(trial_id)?;
        }
        self.environment.get_environment(trial_id)
    }

    /// Full record of one environment category.
    ///
    /// # Errors
    /// `Other` for an unknown category; `TrialNotFound` for an unknown trial.
    pub fn get_environment_detail(&self, category: &str, trial_id: Option<TrialId>) -> Result<String> {
        if let Some(trial_id) = trial_id {
            self.check_trial_id(trial_id)?;
        }
        self.environment.get_detail(category, trial_id)
    }

    /// Crate and feature list.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial.
    pub fn get_requirements(&self, trial_id: Option<TrialId>) -> Result<String> {
        self.get_environment_detail("requirements", trial_id)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Record `(epoch, value)` for `key` in the running trial.
    ///
    /// # Errors
    /// `TrialNotFound` outside a trial; `InvalidKey` for a malformed key.
    pub fn save_metric(&self, key: &str, epoch: u64, value: f64) -> Result<()> {
        let trial_id = self.trials.current_trial_id()?;
        self.metrics.save(key, trial_id, epoch, value)
    }

    /// Load `key` for `trial_ids`, aligned on epochs.
    ///
    /// # Errors
    /// `TrialNotFound` for an unknown trial or one without this metric;
    /// `MetricKeyNotFound` if the key was never saved.
    pub fn load_metric(&self, key: &str, trial_ids: &[TrialId]) -> Result<MetricTable> {
        for trial_id in trial_ids {
            self.check_trial_id(*trial_id)?;
        }
        self.metrics.load(key, trial_ids)
    }

    /// Every metric name recorded in this experiment.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn metric_keys(&self) -> Result<Vec<String>> {
        self.metrics.keys()
    }
}

impl StepObserver for Experiment {
    fn on_output(&self, step: &str, persist: bool, inputs: &[Value], output: &Value) -> Result<()> {
        self.trials.maybe_pure(step, inputs, output)?;
        if persist {
            validate_key(step, "Step name")?;
            let trial_id = self.trials.current_trial_id()?;
            self.storage
                .save_object(&self.storage.persist_key(step, trial_id), output)?;
        }
        Ok(())
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trial_id = self
            .trials
            .latest_trial_id()
            .map_or_else(|_| "?".to_string(), |id| id.to_string());
        write!(
            f,
            "Experiment(id: {}, trial_id: {trial_id}, backend: {})",
            self.id,
            self.storage.backend().location()
        )
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("id", &self.id)
            .field("storage", &self.storage)
            .field("trials", &self.trials)
            .field("executor", &self.executor)
            .field("default_seed", &self.default_seed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Collector, Snapshot};
    use crate::StepError;
    use rand::Rng;
    use serde_json::json;

    fn fixed_environment() -> Vec<(Collector, Snapshot)> {
        vec![(Collector::Requirements, Snapshot::Text("trialbook==test".to_string()))]
    }

    fn memory(id: &str) -> Arc<Experiment> {
        Experiment::builder(id)
            .backend("memory://")
            .environment(fixed_environment())
            .build()
            .unwrap()
    }

    fn inc(exp: &Arc<Experiment>) -> ResultHandle {
        exp.result("inc", |args| {
            let a = args[0]
                .as_i64()
                .ok_or_else(|| StepError::new("TypeError", "a must be an integer"))?;
            Ok(json!(a + 1))
        })
    }

    #[test]
    fn test_inc_scenario() {
        let exp = memory("inc");
        let a = exp.parameter("a", None).unwrap();
        let result = inc(&exp).call([&a]);

        exp.set_parameters([("a", json!(1))]).unwrap();
        assert_eq!(result.compute().unwrap(), json!(2));
        assert_eq!(exp.trial_id().unwrap(), 1);

        exp.set_parameters([("a", json!(3))]).unwrap();
        assert_eq!(result.compute().unwrap(), json!(4));
        assert_eq!(exp.trial_id().unwrap(), 2);

        let history = exp.get_history().unwrap();
        assert_eq!(history.trial_ids(), vec![1, 2]);
        assert_eq!(history.value(1, "a"), Some(json!(1)));
        assert_eq!(history.value(2, "Result"), Some(json!(4)));
        assert_eq!(exp.get_parameters(Some(1)).unwrap()["a"], json!(1));
    }

    #[test]
    fn test_undefined_parameter_consumes_no_id() {
        let exp = memory("undefined");
        let a = exp.parameter("a", None).unwrap();
        let err = inc(&exp).call([&a]).compute().unwrap_err();
        assert!(matches!(err, Error::ParameterUndefined(_)));
        assert_eq!(exp.trial_id().unwrap(), 0);
        assert!(exp.get_history().unwrap().is_empty());
    }

    #[test]
    fn test_trial_ids_inside_step() {
        let exp = memory("inside");
        let observed = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&exp);
        let sink = Arc::clone(&observed);
        let observe = exp.result("observe", move |_| {
            let exp = weak.upgrade().ok_or_else(|| StepError::new("Gone", "experiment dropped"))?;
            let locked = matches!(exp.trial_id(), Err(Error::LockedTrial(_)));
            *sink.lock() = Some((locked, exp.current_trial_id().ok(), exp.seed()));
            Ok(json!(null))
        });

        observe.call(Vec::<Node>::new()).compute_with_seed(42).unwrap();
        assert_eq!(*observed.lock(), Some((true, Some(1), Some(42))));
        assert!(matches!(exp.current_trial_id(), Err(Error::TrialNotFound(_))));
        assert_eq!(exp.get_history().unwrap().value(1, "Seed"), Some(json!(42)));
    }

    #[test]
    fn test_reentrant_compute_is_locked() {
        let exp = memory("reentrant");
        let slot: Arc<Mutex<Option<ResultNode>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let outer = exp.result("outer", move |_| {
            let node = inner.lock().clone();
            match node.map(|n| n.compute()) {
                Some(Err(Error::LockedTrial(_))) => Ok(json!("locked")),
                other => Err(StepError::new("Unexpected", format!("{other:?}"))),
            }
        });
        let node = outer.call(Vec::<Node>::new());
        *slot.lock() = Some(node.clone());

        assert_eq!(node.compute().unwrap(), json!("locked"));
        assert_eq!(exp.trial_id().unwrap(), 1);
    }

    #[test]
    fn test_persisted_step() {
        let exp = memory("persisted");
        let a = exp.parameter("a", None).unwrap();
        let double = exp.persist("double", |args| Ok(json!(args[0].as_i64().unwrap_or(0) * 2)));
        let total = exp.result("total", |args| Ok(args[0].clone()));
        let node = total.call([double.call([&a])]);

        exp.set_parameters([("a", json!(5))]).unwrap();
        node.compute().unwrap();
        assert_eq!(exp.get_persisted("double", 1).unwrap(), json!(10));
        assert!(matches!(exp.get_persisted("double", 2), Err(Error::TrialNotFound(_))));
        assert!(matches!(exp.get_persisted("total", 1), Err(Error::TrialNotFound(_))));
    }

    #[test]
    fn test_metrics_during_trial() {
        let exp = memory("metrics");
        let weak = Arc::downgrade(&exp);
        let train = exp.result("train", move |_| {
            let exp = weak.upgrade().ok_or_else(|| StepError::new("Gone", "experiment dropped"))?;
            for epoch in 0..3_u32 {
                exp.save_metric("loss", u64::from(epoch), 1.0 / f64::from(epoch + 1))
                    .map_err(|e| StepError::new(e.kind(), e.to_string()))?;
            }
            Ok(json!(true))
        });
        train.call(Vec::<Node>::new()).compute().unwrap();

        let table = exp.load_metric("loss", &[1]).unwrap();
        assert_eq!(table.epochs(), &[0, 1, 2]);
        assert_eq!(table.get(1, 1), Some(0.5));
        assert_eq!(exp.metric_keys().unwrap(), vec!["loss".to_string()]);
        assert!(matches!(exp.save_metric("loss", 4, 0.1), Err(Error::TrialNotFound(_))));
        assert!(matches!(exp.load_metric("loss", &[2]), Err(Error::TrialNotFound(_))));
        assert!(matches!(exp.load_metric("acc", &[1]), Err(Error::MetricKeyNotFound(_))));
    }

    #[test]
    fn test_code_and_environment_per_trial() {
        let exp = memory("code");
        let step = exp.result("one", |_| Ok(json!(1))).with_source("|_| Ok(json!(1))");
        step.call(Vec::<Node>::new()).compute().unwrap();

        assert_eq!(exp.get_code(Some(1)).unwrap(), "|_| Ok(json!(1))\n");
        assert_eq!(exp.get_code(None).unwrap(), "|_| Ok(json!(1))");
        assert_eq!(exp.get_requirements(Some(1)).unwrap(), "trialbook==test");
        assert!(matches!(exp.get_code(Some(0)), Err(Error::TrialNotFound(_))));
        assert!(matches!(exp.get_code(Some(2)), Err(Error::TrialNotFound(_))));
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let exp = memory("rng");
        let weak = Arc::downgrade(&exp);
        let draw = exp.result("draw", move |_| {
            let exp = weak.upgrade().ok_or_else(|| StepError::new("Gone", "experiment dropped"))?;
            let mut rng = exp
                .seeded_rng()
                .map_err(|e| StepError::new(e.kind(), e.to_string()))?;
            Ok(json!(rng.gen::<u32>()))
        });
        let node = draw.call(Vec::<Node>::new());
        let first = node.compute_with_seed(7).unwrap();
        let second = node.compute_with_seed(7).unwrap();
        assert_eq!(first, second);
        assert!(exp.seeded_rng().is_err());
    }

    #[test]
    fn test_default_seed() {
        let exp = Experiment::builder("default_seed")
            .backend("memory://")
            .environment(fixed_environment())
            .seed(123)
            .build()
            .unwrap();
        exp.result("one", |_| Ok(json!(1)))
            .call(Vec::<Node>::new())
            .compute()
            .unwrap();
        assert_eq!(exp.get_history().unwrap().value(1, "Seed"), Some(json!(123)));
    }

    #[test]
    fn test_set_parameters_from_args() {
        let exp = memory("args");
        exp.parameter("a", None).unwrap();
        exp.parameter("mode", Some(json!("slow"))).unwrap();
        exp.set_parameters_from_args(["a=2", "mode=fast"]).unwrap();
        let params = exp.get_parameters(None).unwrap();
        assert_eq!(params["a"], json!(2));
        assert_eq!(params["mode"], json!("fast"));
        assert!(matches!(
            exp.set_parameters_from_args(["b=1"]),
            Err(Error::ParameterNotDeclared(_))
        ));
    }

    #[test]
    fn test_display() {
        let exp = memory("display");
        assert!(exp.to_string().starts_with("Experiment(id: display, trial_id: 0, backend: "));
    }
}
