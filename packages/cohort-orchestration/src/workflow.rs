//! Declarative per-row workflows
//!
//! A pipeline builder does not compute anything: it wires [`Operation`]s
//! together with lazy references to the pipeline's inputs, its parameters
//! and the outputs of earlier operations. The resulting [`Workflow`] is run
//! later, once per task node, by an execution engine.

use cohort_storage::ItemValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::parameter::ParameterValues;

/// Concrete value flowing through a workflow
#[derive(Debug, Clone, PartialEq)]
pub enum TaskValue {
    Item(ItemValue),
    /// Items of a finer-frequency input, ordered by row ids
    Sequence(Vec<ItemValue>),
    Param(Value),
}

impl TaskValue {
    pub fn as_item(&self) -> Option<&ItemValue> {
        match self {
            TaskValue::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[ItemValue]> {
        match self {
            TaskValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Field content or parameter value
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TaskValue::Item(ItemValue::Field(value)) | TaskValue::Param(value) => Some(value),
            _ => None,
        }
    }

    /// Local paths of a file-set item
    pub fn paths(&self) -> Option<&[PathBuf]> {
        self.as_item().and_then(ItemValue::paths)
    }
}

/// Reference to a value that only exists once the workflow runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazyValue {
    Input(String),
    Param(String),
    Node { node: usize, output: String },
}

/// Unit of work inside a workflow
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    /// Compute named outputs, writing any files under `work_dir`
    fn run(
        &self,
        args: &BTreeMap<String, TaskValue>,
        work_dir: &Path,
    ) -> anyhow::Result<BTreeMap<String, TaskValue>>;
}

struct FnOperation<F> {
    name: String,
    f: F,
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(&BTreeMap<String, TaskValue>, &Path) -> anyhow::Result<BTreeMap<String, TaskValue>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        args: &BTreeMap<String, TaskValue>,
        work_dir: &Path,
    ) -> anyhow::Result<BTreeMap<String, TaskValue>> {
        (self.f)(args, work_dir)
    }
}

/// Wrap a closure as an [`Operation`]
pub fn operation_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Operation>
where
    F: Fn(&BTreeMap<String, TaskValue>, &Path) -> anyhow::Result<BTreeMap<String, TaskValue>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnOperation {
        name: name.into(),
        f,
    })
}

/// Handle on an operation added to a [`WorkflowBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    index: usize,
}

impl NodeHandle {
    pub fn output(&self, name: impl Into<String>) -> LazyValue {
        LazyValue::Node {
            node: self.index,
            output: name.into(),
        }
    }
}

struct WorkflowNode {
    operation: Arc<dyn Operation>,
    args: BTreeMap<String, LazyValue>,
}

/// Graph-construction handle passed to pipeline builders
pub struct WorkflowBuilder {
    pipeline: String,
    inputs: BTreeSet<String>,
    parameters: BTreeSet<String>,
    nodes: Vec<WorkflowNode>,
}

impl WorkflowBuilder {
    pub fn new<I, P>(pipeline: impl Into<String>, inputs: I, parameters: P) -> Self
    where
        I: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            pipeline: pipeline.into(),
            inputs: inputs.into_iter().collect(),
            parameters: parameters.into_iter().collect(),
            nodes: Vec::new(),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Lazy reference to a declared input column
    pub fn input(&self, column: &str) -> Result<LazyValue> {
        if !self.inputs.contains(column) {
            return Err(OrchestratorError::MissingDependency(format!(
                "'{}' is not an input of pipeline '{}'",
                column, self.pipeline
            )));
        }
        Ok(LazyValue::Input(column.to_string()))
    }

    /// Lazy reference to a declared parameter
    pub fn param(&self, name: &str) -> Result<LazyValue> {
        if !self.parameters.contains(name) {
            return Err(OrchestratorError::UnknownParameter(format!(
                "{} (not declared by pipeline '{}')",
                name, self.pipeline
            )));
        }
        Ok(LazyValue::Param(name.to_string()))
    }

    /// Append an operation fed by `args`
    pub fn add<I, K>(&mut self, operation: Arc<dyn Operation>, args: I) -> Result<NodeHandle>
    where
        I: IntoIterator<Item = (K, LazyValue)>,
        K: Into<String>,
    {
        let args: BTreeMap<String, LazyValue> =
            args.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for lazy in args.values() {
            self.check(lazy)?;
        }
        self.nodes.push(WorkflowNode { operation, args });
        Ok(NodeHandle {
            index: self.nodes.len() - 1,
        })
    }

    /// Seal the workflow with its outputs keyed by sink column
    pub fn finish(self, outputs: BTreeMap<String, LazyValue>) -> Result<Workflow> {
        for lazy in outputs.values() {
            self.check(lazy)?;
        }
        Ok(Workflow {
            pipeline: self.pipeline,
            nodes: self.nodes,
            outputs,
        })
    }

    fn check(&self, lazy: &LazyValue) -> Result<()> {
        match lazy {
            LazyValue::Input(column) => self.input(column).map(|_| ()),
            LazyValue::Param(name) => self.param(name).map(|_| ()),
            LazyValue::Node { node, .. } if *node < self.nodes.len() => Ok(()),
            LazyValue::Node { node, .. } => Err(OrchestratorError::MissingDependency(format!(
                "operation #{} does not exist yet in pipeline '{}'",
                node, self.pipeline
            ))),
        }
    }
}

/// Sealed, runnable workflow of one pipeline
///
/// Operations only reference earlier operations, so running them in
/// insertion order respects every dependency.
pub struct Workflow {
    pipeline: String,
    nodes: Vec<WorkflowNode>,
    outputs: BTreeMap<String, LazyValue>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("pipeline", &self.pipeline)
            .field("operations", &self.operation_names())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Workflow {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn operation_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.operation.name()).collect()
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Run every operation and collect the workflow outputs
    pub fn execute(
        &self,
        inputs: &BTreeMap<String, TaskValue>,
        parameters: &ParameterValues,
        work_dir: &Path,
    ) -> Result<BTreeMap<String, TaskValue>> {
        let mut produced: Vec<BTreeMap<String, TaskValue>> = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            let mut args = BTreeMap::new();
            for (name, lazy) in &node.args {
                args.insert(name.clone(), self.lookup(lazy, inputs, parameters, &produced)?);
            }
            let dir = work_dir.join(format!("{}-{}", index, node.operation.name()));
            std::fs::create_dir_all(&dir)?;
            debug!(
                pipeline = %self.pipeline,
                operation = node.operation.name(),
                "Running operation"
            );
            let outputs = node
                .operation
                .run(&args, &dir)
                .map_err(|e| {
                    OrchestratorError::task_failed(node.operation.name(), format!("{:#}", e))
                })?;
            produced.push(outputs);
        }
        let mut outputs = BTreeMap::new();
        for (column, lazy) in &self.outputs {
            outputs.insert(column.clone(), self.lookup(lazy, inputs, parameters, &produced)?);
        }
        Ok(outputs)
    }

    fn lookup(
        &self,
        lazy: &LazyValue,
        inputs: &BTreeMap<String, TaskValue>,
        parameters: &ParameterValues,
        produced: &[BTreeMap<String, TaskValue>],
    ) -> Result<TaskValue> {
        let missing = |what: String| {
            OrchestratorError::MissingDependency(format!(
                "{} was not provided to pipeline '{}'",
                what, self.pipeline
            ))
        };
        match lazy {
            LazyValue::Input(column) => inputs
                .get(column)
                .cloned()
                .ok_or_else(|| missing(format!("input '{}'", column))),
            LazyValue::Param(name) => parameters
                .get(name)
                .cloned()
                .map(TaskValue::Param)
                .ok_or_else(|| missing(format!("parameter '{}'", name))),
            LazyValue::Node { node, output } => produced
                .get(*node)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .ok_or_else(|| {
                    missing(format!("output '{}' of operation #{}", output, node))
                }),
        }
    }
}
