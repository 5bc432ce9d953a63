//! Lazy step graph.
//!
//! A [`Node`] is a constant, a parameter, or a call of a [`Step`] on other
//! nodes. Nothing runs until an [`Executor`] evaluates a node; every node is
//! evaluated at most once per execution, so a step shared by two branches
//! runs once.
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use trialbook::graph::{Node, Step};
//!
//! # fn main() -> trialbook::Result<()> {
//! let add = Arc::new(Step::new("add", |args| {
//!     Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
//! }));
//! let two = Node::call(&add, [json!(1), json!(1)]);
//! let four = Node::call(&add, [two.clone(), two]);
//! assert_eq!(four.compute()?, json!(4));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::StepError;
use crate::parameter::Parameter;
use crate::{Result, Value};

/// What a step function returns.
pub type StepOutput = std::result::Result<Value, StepError>;

/// A step function: positional inputs in, one value out.
pub type StepFn = dyn Fn(&[Value]) -> StepOutput + Send + Sync;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Hook called with every output a step produces.
pub trait StepObserver: Send + Sync {
    /// `step` produced `output` from `inputs`.
    ///
    /// # Errors
    /// Errors abort the execution.
    fn on_output(&self, step: &str, persist: bool, inputs: &[Value], output: &Value) -> Result<()>;
}

/// A named user function.
pub struct Step {
    name: String,
    func: Arc<StepFn>,
    persist: bool,
    observer: Option<Arc<dyn StepObserver>>,
}

impl Step {
    /// Untracked step.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> StepOutput + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            persist: false,
            observer: None,
        }
    }

    /// Report every output to `observer`.
    #[must_use]
    pub fn observed(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Mark the output as one to keep per trial.
    #[must_use]
    pub const fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether outputs are kept per trial.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        self.persist
    }

    /// Run the function on concrete inputs and notify the observer.
    ///
    /// # Errors
    /// `Step` if the function fails; observer errors.
    pub fn invoke(&self, inputs: &[Value]) -> Result<Value> {
        tracing::trace!(step = %self.name, "Invoking step");
        let output = (self.func)(inputs)?;
        if let Some(observer) = &self.observer {
            observer.on_output(&self.name, self.persist, inputs, &output)?;
        }
        Ok(output)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("persist", &self.persist)
            .field("observed", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

enum NodeKind {
    Constant(Value),
    Parameter(Parameter),
    Call { step: Arc<Step>, args: Vec<Node> },
}

struct NodeInner {
    id: u64,
    kind: NodeKind,
}

/// Lazy value in the step graph. Cloning shares the node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    fn from_kind(kind: NodeKind) -> Self {
        Self(Arc::new(NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }))
    }

    /// Node that always yields `value`.
    #[must_use]
    pub fn constant(value: Value) -> Self {
        Self::from_kind(NodeKind::Constant(value))
    }

    /// Node that applies `step` to `args`.
    pub fn call<I, N>(step: &Arc<Step>, args: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Self>,
    {
        Self::from_kind(NodeKind::Call {
            step: Arc::clone(step),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Process-unique node id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Step name, parameter name, or the constant's JSON text.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.0.kind {
            NodeKind::Constant(v) => v.to_string(),
            NodeKind::Parameter(p) => p.name().to_string(),
            NodeKind::Call { step, .. } => step.name().to_string(),
        }
    }

    /// Direct inputs.
    #[must_use]
    pub fn dependencies(&self) -> &[Self] {
        match &self.0.kind {
            NodeKind::Call { args, .. } => args,
            _ => &[],
        }
    }

    /// Evaluate with the [`Sequential`] executor.
    ///
    /// # Errors
    /// Parameter resolution and step errors.
    pub fn compute(&self) -> Result<Value> {
        Sequential.execute(self)
    }

    /// Evaluate this node once its inputs are known.
    fn evaluate(&self, inputs: &[Value]) -> Result<Value> {
        match &self.0.kind {
            NodeKind::Constant(v) => Ok(v.clone()),
            NodeKind::Parameter(p) => p.resolve(),
            NodeKind::Call { step, .. } => step.invoke(inputs),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            NodeKind::Constant(v) => write!(f, "Constant({v})"),
            NodeKind::Parameter(p) => write!(f, "{p:?}"),
            NodeKind::Call { step, args } => {
                let args: Vec<String> = args.iter().map(Self::label).collect();
                write!(f, "{}({})", step.name(), args.join(", "))
            }
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Self::constant(value)
    }
}

impl From<&Node> for Node {
    fn from(node: &Node) -> Self {
        node.clone()
    }
}

impl From<Parameter> for Node {
    fn from(parameter: Parameter) -> Self {
        Self::from_kind(NodeKind::Parameter(parameter))
    }
}

impl From<&Parameter> for Node {
    fn from(parameter: &Parameter) -> Self {
        parameter.clone().into()
    }
}

impl Parameter {
    /// Graph leaf resolving this parameter at execution time.
    #[must_use]
    pub fn node(&self) -> Node {
        self.into()
    }
}

/// Evaluates a graph to a concrete value.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Evaluate `node` and everything it depends on.
    ///
    /// # Errors
    /// The first parameter or step error encountered.
    fn execute(&self, node: &Node) -> Result<Value>;
}

/// Depth-first, single-threaded executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl Sequential {
    fn evaluate(node: &Node, memo: &mut FxHashMap<u64, Value>) -> Result<Value> {
        if let Some(value) = memo.get(&node.id()) {
            return Ok(value.clone());
        }
        let inputs = node
            .dependencies()
            .iter()
            .map(|dep| Self::evaluate(dep, memo))
            .collect::<Result<Vec<_>>>()?;
        let value = node.evaluate(&inputs)?;
        memo.insert(node.id(), value.clone());
        Ok(value)
    }
}

impl Executor for Sequential {
    fn execute(&self, node: &Node) -> Result<Value> {
        Self::evaluate(node, &mut FxHashMap::default())
    }
}

/// Executor that evaluates independent nodes on the rayon pool.
///
/// Nodes are grouped by height (leaves first); every node of a level runs
/// in parallel once the level below is complete.
#[cfg(feature = "rayon")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Threaded;

#[cfg(feature = "rayon")]
impl Threaded {
    fn levels(root: &Node) -> Vec<Vec<Node>> {
        fn height(node: &Node, heights: &mut FxHashMap<u64, usize>, levels: &mut Vec<Vec<Node>>) -> usize {
            if let Some(h) = heights.get(&node.id()) {
                return *h;
            }
            let h = node
                .dependencies()
                .iter()
                .map(|dep| height(dep, heights, levels) + 1)
                .max()
                .unwrap_or(0);
            heights.insert(node.id(), h);
            if levels.len() <= h {
                levels.resize_with(h + 1, Vec::new);
            }
            levels[h].push(node.clone());
            h
        }

        let mut levels = Vec::new();
        height(root, &mut FxHashMap::default(), &mut levels);
        levels
    }
}

#[cfg(feature = "rayon")]
impl Executor for Threaded {
    fn execute(&self, node: &Node) -> Result<Value> {
        use dashmap::DashMap;
        use rayon::prelude::*;

        let memo: DashMap<u64, Value> = DashMap::new();
        for level in Self::levels(node) {
            let outputs: Vec<Result<Value>> = level
                .par_iter()
                .map(|n| {
                    let inputs: Vec<Value> = n
                        .dependencies()
                        .iter()
                        .filter_map(|dep| memo.get(&dep.id()).map(|v| v.clone()))
                        .collect();
                    n.evaluate(&inputs)
                })
                .collect();
            for (n, output) in level.iter().zip(outputs) {
                memo.insert(n.id(), output?);
            }
        }
        memo.get(&node.id())
            .map(|v| v.clone())
            .ok_or_else(|| crate::Error::Other(format!("Node was not evaluated: {node:?}")))
    }
}
