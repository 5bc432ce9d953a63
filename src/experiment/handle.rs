//! Handles returned when a function is registered as a step.

use std::fmt;
use std::sync::Arc;

use super::Experiment;
use crate::graph::{Node, Step};
use crate::{Result, Value};

/// A tracked step. Calling it builds a lazy [`Node`].
#[derive(Clone)]
pub struct StepHandle {
    step: Arc<Step>,
    experiment: Arc<Experiment>,
}

impl StepHandle {
    pub(crate) const fn new(step: Arc<Step>, experiment: Arc<Experiment>) -> Self {
        Self { step, experiment }
    }

    /// Register the step's source text (see [`crate::sourced`]).
    #[must_use]
    pub fn with_source(self, source: &str) -> Self {
        self.experiment.code.register(self.step.name(), source);
        self
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Underlying step.
    #[must_use]
    pub const fn step(&self) -> &Arc<Step> {
        &self.step
    }

    /// Lazy call of the step on `args`.
    pub fn call<I, N>(&self, args: I) -> Node
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        Node::call(&self.step, args)
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandle")
            .field("step", &self.step)
            .field("experiment", &self.experiment.id())
            .finish()
    }
}

/// The terminal step. Calling it builds a [`ResultNode`], whose
/// computation is a trial.
#[derive(Debug, Clone)]
pub struct ResultHandle {
    inner: StepHandle,
}

impl ResultHandle {
    pub(crate) const fn new(inner: StepHandle) -> Self {
        Self { inner }
    }

    /// Register the step's source text (see [`crate::sourced`]).
    #[must_use]
    pub fn with_source(self, source: &str) -> Self {
        Self {
            inner: self.inner.with_source(source),
        }
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Lazy call of the terminal step on `args`.
    pub fn call<I, N>(&self, args: I) -> ResultNode
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        ResultNode {
            node: self.inner.call(args),
            experiment: Arc::clone(&self.inner.experiment),
        }
    }
}

/// A terminal node bound to its experiment.
#[derive(Clone)]
pub struct ResultNode {
    node: Node,
    experiment: Arc<Experiment>,
}

impl ResultNode {
    /// The graph node.
    #[must_use]
    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Run one trial with the experiment's default seed (or a fresh one).
    ///
    /// # Errors
    ///
    /// - `ParameterUndefined` before any trial id is allocated
    /// - `LockedTrial` if a trial is already running
    /// - the step's own error, after the failed trial is recorded
    pub fn compute(&self) -> Result<Value> {
        self.experiment.run_trial(&self.node, None)
    }

    /// Run one trial with an explicit seed.
    ///
    /// # Errors
    /// See [`ResultNode::compute`].
    pub fn compute_with_seed(&self, seed: u32) -> Result<Value> {
        self.experiment.run_trial(&self.node, Some(seed))
    }
}

impl fmt::Debug for ResultNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultNode")
            .field("node", &self.node)
            .field("experiment", &self.experiment.id())
            .finish()
    }
}
