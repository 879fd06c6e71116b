//! Pipeline declarations
//!
//! A pipeline names the columns it consumes and the sink columns it
//! produces, the parameters it depends on, the guard under which it applies
//! and a [`PipelineBuilder`] that wires its [`Workflow`].

use cohort_core::Frequency;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::guard::Guard;
use crate::parameter::ParameterValues;
use crate::workflow::{LazyValue, Workflow, WorkflowBuilder};

/// Column consumed by a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInput {
    pub column: String,
    /// Format the workflow expects; the column's own format when unset
    pub format: Option<String>,
}

/// Sink column produced by a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub column: String,
    /// Format the workflow produces; the column's own format when unset
    pub format: Option<String>,
}

/// Named arguments handed to a [`PipelineBuilder`]
pub struct BuilderArgs<'a> {
    pub parameters: &'a ParameterValues,
    inputs: BTreeMap<String, LazyValue>,
}

impl<'a> BuilderArgs<'a> {
    pub fn input(&self, column: &str) -> Option<LazyValue> {
        self.inputs.get(column).cloned()
    }

    /// Current value of a parameter, for builders whose wiring depends on it
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.get(name)
    }
}

/// Lazy outputs keyed by sink column
pub type BuiltOutputs = BTreeMap<String, LazyValue>;

/// Wires the workflow of a pipeline
///
/// Builders must only describe work: nothing is read or written until the
/// resulting workflow is executed.
pub trait PipelineBuilder: Send + Sync {
    fn build(&self, wf: &mut WorkflowBuilder, args: &BuilderArgs<'_>) -> Result<BuiltOutputs>;
}

struct FnBuilder<F>(F);

impl<F> PipelineBuilder for FnBuilder<F>
where
    F: Fn(&mut WorkflowBuilder, &BuilderArgs<'_>) -> Result<BuiltOutputs> + Send + Sync,
{
    fn build(&self, wf: &mut WorkflowBuilder, args: &BuilderArgs<'_>) -> Result<BuiltOutputs> {
        (self.0)(wf, args)
    }
}

/// Wrap a closure as a [`PipelineBuilder`]
pub fn builder_fn<F>(f: F) -> Arc<dyn PipelineBuilder>
where
    F: Fn(&mut WorkflowBuilder, &BuilderArgs<'_>) -> Result<BuiltOutputs> + Send + Sync + 'static,
{
    Arc::new(FnBuilder(f))
}

/// Declaration of a pipeline
#[derive(Clone)]
pub struct PipelineSpec {
    pub name: String,
    pub inputs: Vec<PipelineInput>,
    pub outputs: Vec<PipelineOutput>,
    pub parameters: Vec<String>,
    pub guard: Guard,
    pub priority: i32,
    pub builder: Arc<dyn PipelineBuilder>,
}

impl fmt::Debug for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("parameters", &self.parameters)
            .field("guard", &self.guard)
            .field("priority", &self.priority)
            .finish()
    }
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, builder: Arc<dyn PipelineBuilder>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
            guard: Guard::Always,
            priority: 0,
            builder,
        }
    }

    pub fn input(mut self, column: impl Into<String>) -> Self {
        self.inputs.push(PipelineInput {
            column: column.into(),
            format: None,
        });
        self
    }

    /// Input converted to `format` before the workflow sees it
    pub fn input_as(mut self, column: impl Into<String>, format: impl Into<String>) -> Self {
        self.inputs.push(PipelineInput {
            column: column.into(),
            format: Some(format.into()),
        });
        self
    }

    pub fn output(mut self, column: impl Into<String>) -> Self {
        self.outputs.push(PipelineOutput {
            column: column.into(),
            format: None,
        });
        self
    }

    /// Output produced in `format`, converted to the column format when stored
    pub fn output_as(mut self, column: impl Into<String>, format: impl Into<String>) -> Self {
        self.outputs.push(PipelineOutput {
            column: column.into(),
            format: Some(format.into()),
        });
        self
    }

    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn input_columns(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.column.as_str())
    }

    pub fn output_columns(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.column.as_str())
    }

    pub fn produces(&self, column: &str) -> bool {
        self.output_columns().any(|c| c == column)
    }
}

/// Pipeline accepted by a registry, with its frequency fixed by its outputs
#[derive(Debug)]
pub struct RegisteredPipeline {
    pub spec: PipelineSpec,
    pub frequency: Frequency,
}

impl RegisteredPipeline {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Values of the parameters this pipeline declares
    pub fn declared_values(&self, all: &ParameterValues) -> ParameterValues {
        self.spec
            .parameters
            .iter()
            .filter_map(|name| all.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Run the builder against a fresh workflow handle
    pub fn build_workflow(&self, parameters: &ParameterValues) -> Result<Workflow> {
        let mut wf = WorkflowBuilder::new(
            self.spec.name.clone(),
            self.spec.inputs.iter().map(|i| i.column.clone()),
            self.spec.parameters.iter().cloned(),
        );
        let args = BuilderArgs {
            parameters,
            inputs: self
                .spec
                .inputs
                .iter()
                .map(|i| (i.column.clone(), LazyValue::Input(i.column.clone())))
                .collect(),
        };
        let outputs = self.spec.builder.build(&mut wf, &args)?;
        let missing: Vec<&str> = self
            .spec
            .output_columns()
            .filter(|column| !outputs.contains_key(*column))
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::invalid_pipeline(
                &self.spec.name,
                format!("builder did not produce {}", missing.join(", ")),
            ));
        }
        if let Some(extra) = outputs.keys().find(|column| !self.spec.produces(column)) {
            return Err(OrchestratorError::invalid_pipeline(
                &self.spec.name,
                format!("builder produced undeclared output '{}'", extra),
            ));
        }
        wf.finish(outputs)
    }
}
