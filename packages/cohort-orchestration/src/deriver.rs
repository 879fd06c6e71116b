//! Dataset-facing entry point: plan, hand off, record

use cohort_core::{Dataset, ResolvedInput, ResolvedItem};
use cohort_storage::ItemValue;
use petgraph::graph::NodeIndex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analysis::Analysis;
use crate::engine::{ExecutionEngine, LoadedInputs, NodeOutcome, RunReport, TaskSink};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::graph::{TaskInput, TaskNode};
use crate::planner::{DerivationPlan, DerivationPlanner};
use crate::provenance::Fingerprint;
use crate::report::DerivationReport;
use crate::state::DerivationState;
use crate::workflow::TaskValue;

/// [`TaskSink`] reading from and writing to a dataset
pub struct DatasetSink {
    dataset: Arc<Dataset>,
}

impl DatasetSink {
    pub fn new(dataset: Arc<Dataset>) -> Self {
        Self { dataset }
    }

    fn load(&self, input: &TaskInput, item: &ResolvedItem, dir: &Path) -> Result<ItemValue> {
        let value = self.dataset.resolved_value(item, dir)?;
        if input.conversion.is_identity() {
            return Ok(value);
        }
        Ok(input.conversion.apply(value, dir)?)
    }
}

impl TaskSink for DatasetSink {
    fn load_inputs(&self, node: &TaskNode, work_dir: &Path) -> Result<LoadedInputs> {
        // Rows held by the node may predate items written by upstream tasks
        let row = self.dataset.tree()?.get_row_by_key(node.row_key())?;
        let mut loaded = LoadedInputs::default();
        for input in &node.inputs {
            let resolved = self.dataset.resolve_input(&row, &input.column)?;
            loaded
                .digests
                .insert(input.column.clone(), resolved.digests());
            let dir = work_dir.join(format!("input-{}", input.column));
            let value = match &resolved {
                ResolvedInput::Single(item) => TaskValue::Item(self.load(input, item, &dir)?),
                ResolvedInput::Sequence(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        values.push(self.load(input, item, &dir.join(i.to_string()))?);
                    }
                    TaskValue::Sequence(values)
                }
            };
            loaded.values.insert(input.column.clone(), value);
        }
        Ok(loaded)
    }

    fn store_outputs(
        &self,
        node: &TaskNode,
        inputs: &LoadedInputs,
        outputs: BTreeMap<String, TaskValue>,
        work_dir: &Path,
    ) -> Result<()> {
        let row = self.dataset.tree()?.get_row_by_key(node.row_key())?;
        for output in &node.outputs {
            self.dataset.remove_provenance(&row, &output.column)?;
        }

        let mut digests = BTreeMap::new();
        for output in &node.outputs {
            let value = match outputs.get(&output.column) {
                Some(TaskValue::Item(item)) => item.clone(),
                Some(TaskValue::Param(value)) => ItemValue::Field(value.clone()),
                Some(TaskValue::Sequence(_)) => {
                    return Err(OrchestratorError::task_failed(
                        node.label(),
                        format!("'{}' must be a single item, got a sequence", output.column),
                    ))
                }
                None => {
                    return Err(OrchestratorError::task_failed(
                        node.label(),
                        format!("workflow did not produce '{}'", output.column),
                    ))
                }
            };
            let value = if output.conversion.is_identity() {
                value
            } else {
                output
                    .conversion
                    .apply(value, &work_dir.join(format!("output-{}", output.column)))?
            };
            let entry = self.dataset.write_sink(&row, &output.column, &value)?;
            digests.insert(output.column.clone(), entry.digest());
        }

        let fingerprint = Fingerprint {
            pipeline: node.pipeline.name().to_string(),
            parameters: node.parameters.clone(),
            inputs: inputs.digests.clone(),
        };
        let record = fingerprint.to_record(digests);
        for output in &node.outputs {
            self.dataset
                .write_provenance(&row, &output.column, &record)?;
        }
        debug!(task = %node.label(), outputs = node.outputs.len(), "Stored outputs");
        Ok(())
    }

    fn phase_finished(&self) -> Result<()> {
        // Dependants in the next phase must see the items written by this one
        self.dataset.refresh();
        Ok(())
    }
}

/// Derives sink columns of a dataset with the pipelines of an analysis
pub struct Deriver {
    dataset: Arc<Dataset>,
    analysis: Arc<Analysis>,
}

impl Deriver {
    pub fn new(dataset: Arc<Dataset>, analysis: Arc<Analysis>) -> Self {
        Self { dataset, analysis }
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Plan without running anything
    pub fn plan(&self, sinks: &[&str], ids: Option<&[&str]>) -> Result<DerivationPlan> {
        DerivationPlanner::new(&self.dataset, &self.analysis)?.plan(sinks, ids)
    }

    /// Bring `sinks` up to date at the rows selected by `ids` (all when `None`)
    ///
    /// Rows that cannot be derived are reported as failed without stopping
    /// the others.
    pub async fn derive(
        &self,
        sinks: &[&str],
        ids: Option<&[&str]>,
        engine: &dyn ExecutionEngine,
        cancel: CancellationToken,
    ) -> Result<DerivationReport> {
        let DerivationPlan { graph, mut states } = self.plan(sinks, ids)?;
        let invocations = graph.len();
        let graph = Arc::new(graph);

        let run = if graph.is_empty() {
            RunReport::default()
        } else {
            info!(engine = engine.name(), tasks = invocations, "Handing off derivation");
            let sink: Arc<dyn TaskSink> = Arc::new(DatasetSink::new(Arc::clone(&self.dataset)));
            engine.run(Arc::clone(&graph), sink, cancel).await?
        };

        for machine in states.values_mut() {
            let task = match machine.state() {
                DerivationState::Scheduled { task, .. } => NodeIndex::new(*task),
                _ => continue,
            };
            match run.outcome(task) {
                Some(NodeOutcome::Completed { .. }) => machine.complete()?,
                Some(NodeOutcome::Failed {
                    error,
                    error_category,
                }) => machine.fail(error.clone(), *error_category)?,
                Some(NodeOutcome::Skipped { upstream }) => {
                    let error = OrchestratorError::UpstreamDerivationFailed {
                        upstream: upstream.clone(),
                        row: machine.row.to_string(),
                        reason: "upstream task did not complete".to_string(),
                    };
                    machine.fail(error.to_string(), error.category())?
                }
                Some(NodeOutcome::Cancelled) | None => {
                    machine.fail("derivation cancelled".to_string(), ErrorCategory::Transient)?
                }
            }
        }
        self.dataset.refresh();

        let report = DerivationReport::from_states(states.values(), invocations, run.duration_ms);
        info!(dataset = %self.dataset.id(), "Derivation finished: {}", report);
        Ok(report)
    }
}
