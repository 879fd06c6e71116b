//! Derivation planning
//!
//! Walks requested (sink, row) pairs depth first. Each pair is checked once:
//! the applicable pipeline is selected, sink inputs are planned first, and
//! the stored provenance is compared with the current fingerprint. Stale
//! pairs get a task node (shared by every requested output of the same
//! invocation) wired after the nodes of their upstream sinks.
//!
//! Failures stay local to the pair that hit them and to the pairs consuming
//! it; only a dependency cycle aborts the whole plan.

use cohort_core::{DataError, DataRow, DataTree, Dataset, RowKey};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::Analysis;
use crate::error::{OrchestratorError, Result};
use crate::graph::{TaskGraph, TaskId, TaskInput, TaskNode, TaskOutput};
use crate::guard::GuardContext;
use crate::parameter::ParameterValues;
use crate::pipeline::RegisteredPipeline;
use crate::provenance::{self, Fingerprint};
use crate::state::{DerivationState, DerivationStateMachine};
use crate::workflow::Workflow;

/// (sink column, row) pair tracked by the planner
pub type DerivationKey = (String, RowKey);

#[derive(Debug, Clone)]
enum Outcome {
    UpToDate,
    Scheduled(TaskId),
    Failed(String),
}

/// Result of planning: the task graph and the state of every visited pair
#[derive(Debug)]
pub struct DerivationPlan {
    pub graph: TaskGraph,
    pub states: BTreeMap<DerivationKey, DerivationStateMachine>,
}

impl DerivationPlan {
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn state(&self, sink: &str, row: &RowKey) -> Option<&DerivationState> {
        self.states
            .get(&(sink.to_string(), row.clone()))
            .map(DerivationStateMachine::state)
    }

    /// Pairs that could not be planned, with the reason
    pub fn failures(&self) -> Vec<(&str, &RowKey, &str)> {
        self.states
            .values()
            .filter_map(|sm| match sm.state() {
                DerivationState::Failed { error, .. } => {
                    Some((sm.sink.as_str(), &sm.row, error.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            invocations: self.graph.len(),
            ..Default::default()
        };
        for sm in self.states.values() {
            match sm.state() {
                DerivationState::UpToDate { .. } => summary.up_to_date += 1,
                DerivationState::Scheduled { .. } => summary.scheduled += 1,
                DerivationState::Failed { .. } => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub up_to_date: usize,
    pub scheduled: usize,
    pub failed: usize,
    /// Task nodes, one per (pipeline, row)
    pub invocations: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} up to date, {} scheduled in {} invocations, {} failed",
            self.up_to_date, self.scheduled, self.invocations, self.failed
        )
    }
}

/// Builds a [`DerivationPlan`] for one dataset and analysis
pub struct DerivationPlanner<'a> {
    dataset: &'a Dataset,
    analysis: &'a Analysis,
    tree: Arc<DataTree>,
    graph: TaskGraph,
    outcomes: HashMap<DerivationKey, Outcome>,
    states: BTreeMap<DerivationKey, DerivationStateMachine>,
    visiting: HashSet<DerivationKey>,
    workflows: HashMap<String, Arc<Workflow>>,
}

impl<'a> DerivationPlanner<'a> {
    pub fn new(dataset: &'a Dataset, analysis: &'a Analysis) -> Result<Self> {
        Ok(Self {
            dataset,
            analysis,
            tree: dataset.tree()?,
            graph: TaskGraph::new(),
            outcomes: HashMap::new(),
            states: BTreeMap::new(),
            visiting: HashSet::new(),
            workflows: HashMap::new(),
        })
    }

    /// Plan `sinks` at every row of their frequency, or only the rows whose
    /// id string or label is in `ids`
    pub fn plan(mut self, sinks: &[&str], ids: Option<&[&str]>) -> Result<DerivationPlan> {
        for sink in sinks {
            let spec = self.dataset.column(sink)?;
            if !spec.is_sink() {
                return Err(DataError::InvalidCriterion(format!(
                    "column '{}' is not a sink and cannot be derived",
                    sink
                ))
                .into());
            }
            let rows = self.tree.rows(spec.frequency)?;
            for row in rows {
                if let Some(ids) = ids {
                    let (id, label) = (row.id_string(), row.label());
                    if !ids.iter().any(|wanted| *wanted == id || *wanted == label) {
                        continue;
                    }
                }
                self.visit(sink, &row)?;
            }
        }

        let plan = DerivationPlan {
            graph: self.graph,
            states: self.states,
        };
        info!(
            dataset = %self.dataset.id(),
            sinks = ?sinks,
            "Planned derivation: {}",
            plan.summary()
        );
        Ok(plan)
    }

    fn visit(&mut self, sink: &str, row: &Arc<DataRow>) -> Result<Outcome> {
        let key: DerivationKey = (sink.to_string(), row.key().clone());
        if let Some(outcome) = self.outcomes.get(&key) {
            return Ok(outcome.clone());
        }
        if !self.visiting.insert(key.clone()) {
            return Err(OrchestratorError::DagCycleDetected(format!(
                "'{}' at {} depends on itself",
                sink, row
            )));
        }

        let mut machine = DerivationStateMachine::new(sink, row.key().clone());
        machine.start_check()?;
        let result = self.check(sink, row, &mut machine);
        self.visiting.remove(&key);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e @ OrchestratorError::DagCycleDetected(_)) => return Err(e),
            Err(e) => {
                warn!(sink, row = %row, error = %e, "Derivation cannot be planned");
                machine.fail(e.to_string(), e.category())?;
                Outcome::Failed(e.to_string())
            }
        };
        self.outcomes.insert(key.clone(), outcome.clone());
        self.states.insert(key, machine);
        Ok(outcome)
    }

    fn check(
        &mut self,
        sink: &str,
        row: &Arc<DataRow>,
        machine: &mut DerivationStateMachine,
    ) -> Result<Outcome> {
        let dataset = self.dataset;
        let pipeline = {
            let ctx = GuardContext {
                dataset,
                row: row.as_ref(),
                parameters: self.analysis.parameters(),
            };
            self.analysis.registry().select(sink, &ctx)?
        };

        if let Some(task) = self.graph.find(pipeline.name(), row.key()) {
            machine.needs_recompute(format!("produced with the outputs of {}", pipeline.name()))?;
            self.graph.add_request(task, sink);
            machine.schedule(task.index())?;
            return Ok(Outcome::Scheduled(task));
        }

        let mut upstream = BTreeSet::new();
        for input in &pipeline.spec.inputs {
            let column = dataset.column(&input.column)?;
            if !column.is_sink() {
                continue;
            }
            for related in self.tree.related_rows(row, column.frequency)? {
                match self.visit(&input.column, &related)? {
                    Outcome::UpToDate => {}
                    Outcome::Scheduled(task) => {
                        upstream.insert(task);
                    }
                    Outcome::Failed(reason) => {
                        return Err(OrchestratorError::UpstreamDerivationFailed {
                            upstream: input.column.clone(),
                            row: related.to_string(),
                            reason,
                        })
                    }
                }
            }
        }

        let parameters = pipeline.declared_values(self.analysis.parameters());
        if upstream.is_empty() {
            let fingerprint = self.fingerprint(&pipeline, row, &parameters)?;
            let outputs = self.output_digests(&pipeline, row)?;
            let stored = dataset.read_provenance(row, sink)?;
            let staleness = provenance::check(stored.as_ref(), &fingerprint, &outputs);
            if staleness.is_up_to_date() {
                debug!(sink, row = %row, "Up to date");
                machine.up_to_date()?;
                return Ok(Outcome::UpToDate);
            }
            machine.needs_recompute(staleness.to_string())?;
        } else {
            machine.needs_recompute("upstream derivations scheduled")?;
        }

        let node = self.task_node(&pipeline, row, parameters, sink)?;
        let task = self.graph.add_node(node);
        for dependency in upstream {
            self.graph.add_dependency(dependency, task)?;
        }
        debug!(sink, row = %row, pipeline = pipeline.name(), "Scheduled");
        machine.schedule(task.index())?;
        Ok(Outcome::Scheduled(task))
    }

    /// Fingerprint from the items the inputs resolve to now
    fn fingerprint(
        &self,
        pipeline: &RegisteredPipeline,
        row: &DataRow,
        parameters: &ParameterValues,
    ) -> Result<Fingerprint> {
        let mut fingerprint = Fingerprint::new(pipeline.name());
        fingerprint.parameters = parameters.clone();
        for input in &pipeline.spec.inputs {
            let resolved = self.dataset.resolve_input(row, &input.column)?;
            fingerprint
                .inputs
                .insert(input.column.clone(), resolved.digests());
        }
        Ok(fingerprint)
    }

    fn output_digests(
        &self,
        pipeline: &RegisteredPipeline,
        row: &DataRow,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let mut digests = BTreeMap::new();
        for column in pipeline.spec.output_columns() {
            let digest = match self.dataset.resolve(row, column) {
                Ok(item) => Some(item.digest()),
                Err(DataError::NoMatchingItem { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            digests.insert(column.to_string(), digest);
        }
        Ok(digests)
    }

    fn workflow(&mut self, pipeline: &RegisteredPipeline) -> Result<Arc<Workflow>> {
        if let Some(workflow) = self.workflows.get(pipeline.name()) {
            return Ok(Arc::clone(workflow));
        }
        let workflow = Arc::new(pipeline.build_workflow(self.analysis.parameters())?);
        self.workflows
            .insert(pipeline.name().to_string(), Arc::clone(&workflow));
        Ok(workflow)
    }

    fn task_node(
        &mut self,
        pipeline: &Arc<RegisteredPipeline>,
        row: &Arc<DataRow>,
        parameters: ParameterValues,
        sink: &str,
    ) -> Result<TaskNode> {
        let dataset = self.dataset;
        let formats = dataset.formats();
        let mut inputs = Vec::with_capacity(pipeline.spec.inputs.len());
        for input in &pipeline.spec.inputs {
            let column = dataset.column(&input.column)?;
            let target = input.format.as_deref().unwrap_or(&column.format);
            inputs.push(TaskInput {
                column: input.column.clone(),
                conversion: formats.conversion_path(&column.format, target)?,
                sequence: !row.frequency().is_superset(column.frequency),
            });
        }
        let mut outputs = Vec::with_capacity(pipeline.spec.outputs.len());
        for output in &pipeline.spec.outputs {
            let column = dataset.column(&output.column)?;
            let produced = output.format.as_deref().unwrap_or(&column.format);
            outputs.push(TaskOutput {
                column: output.column.clone(),
                conversion: formats.conversion_path(produced, &column.format)?,
            });
        }
        Ok(TaskNode {
            pipeline: Arc::clone(pipeline),
            row: Arc::clone(row),
            inputs,
            parameters,
            outputs,
            requested: [sink.to_string()].into_iter().collect(),
            workflow: self.workflow(pipeline)?,
        })
    }
}
