//! Execution hand-off
//!
//! An [`ExecutionEngine`] runs a planned [`TaskGraph`]; a [`TaskSink`]
//! connects it back to the dataset, loading each node's inputs and storing
//! its outputs. Scheduling, parallelism and cancellation belong to the
//! engine. [`LocalEngine`] runs phases on the tokio blocking pool, each node
//! in its own work directory that is removed when the node finishes.

use async_trait::async_trait;
use cohort_core::CohortConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::graph::{TaskGraph, TaskId, TaskNode};
use crate::workflow::TaskValue;

/// Inputs of one node, ready for its workflow
#[derive(Debug, Clone, Default)]
pub struct LoadedInputs {
    pub values: BTreeMap<String, TaskValue>,
    /// Digests of the items actually loaded, in consumption order
    pub digests: BTreeMap<String, Vec<String>>,
}

/// Where nodes read their inputs from and write their outputs to
pub trait TaskSink: Send + Sync {
    fn load_inputs(&self, node: &TaskNode, work_dir: &Path) -> Result<LoadedInputs>;

    /// Persist `outputs`; provenance must only be written once every output is stored
    fn store_outputs(
        &self,
        node: &TaskNode,
        inputs: &LoadedInputs,
        outputs: BTreeMap<String, TaskValue>,
        work_dir: &Path,
    ) -> Result<()>;

    /// Called once every node of a phase has finished, before dependants load
    fn phase_finished(&self) -> Result<()> {
        Ok(())
    }
}

/// Final state of one node of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed {
        duration_ms: u64,
    },
    Failed {
        error: String,
        error_category: ErrorCategory,
    },
    /// Not run because a dependency did not complete
    Skipped {
        upstream: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: BTreeMap<TaskId, NodeOutcome>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn outcome(&self, id: TaskId) -> Option<&NodeOutcome> {
        self.outcomes.get(&id)
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }
}

/// Runs task graphs
///
/// Implementations own worker scheduling, parallelism and retries. They
/// must not store the outputs of a node once `cancel` has fired.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        graph: Arc<TaskGraph>,
        sink: Arc<dyn TaskSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport>;
}

/// In-process engine with bounded parallelism
#[derive(Debug, Clone)]
pub struct LocalEngine {
    max_parallel: usize,
    work_root: PathBuf,
}

impl LocalEngine {
    pub fn new(max_parallel: usize, work_root: impl Into<PathBuf>) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            work_root: work_root.into(),
        }
    }

    /// Parallelism and work directories from the runtime configuration
    pub fn from_config(config: &CohortConfig) -> Self {
        Self::new(config.max_parallel_tasks, config.cache_dir.join("work"))
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(
        &self,
        graph: Arc<TaskGraph>,
        sink: Arc<dyn TaskSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let phases = graph.execution_phases()?;
        info!(
            tasks = graph.len(),
            max_parallel = self.max_parallel,
            "Execution plan:\n{}",
            graph.execution_plan()?
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut outcomes: BTreeMap<TaskId, NodeOutcome> = BTreeMap::new();

        for (phase_idx, group) in phases.iter().enumerate() {
            info!(
                "Phase {} - {} tasks{}",
                phase_idx + 1,
                group.len(),
                if group.len() > 1 { " (parallel)" } else { "" }
            );

            let mut ids = Vec::new();
            let mut tasks = Vec::new();
            for &id in group {
                let node = graph.node(id).ok_or_else(|| {
                    OrchestratorError::MissingDependency(format!("task #{} vanished", id.index()))
                })?;
                let blocked = graph
                    .dependencies(id)
                    .into_iter()
                    .find(|dep| !matches!(outcomes.get(dep), Some(NodeOutcome::Completed { .. })));
                if let Some(dep) = blocked {
                    let upstream = graph.node(dep).map(TaskNode::label).unwrap_or_default();
                    warn!(task = %node.label(), upstream = %upstream, "Skipping task");
                    outcomes.insert(id, NodeOutcome::Skipped { upstream });
                    continue;
                }
                if cancel.is_cancelled() {
                    outcomes.insert(id, NodeOutcome::Cancelled);
                    continue;
                }

                ids.push(id);
                tasks.push(tokio::spawn(run_node(
                    Arc::clone(&graph),
                    id,
                    Arc::clone(&sink),
                    Arc::clone(&semaphore),
                    cancel.clone(),
                    self.work_root.clone(),
                )));
            }

            // Wait for the whole phase before starting dependants
            let results = futures::future::join_all(tasks).await;
            for (id, result) in ids.into_iter().zip(results) {
                let label = graph.node(id).map(TaskNode::label).unwrap_or_default();
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(join_err) => NodeOutcome::Failed {
                        error: format!("task panicked: {}", join_err),
                        error_category: ErrorCategory::Infrastructure,
                    },
                };
                match &outcome {
                    NodeOutcome::Completed { duration_ms } => {
                        info!(task = %label, duration_ms, "Task completed")
                    }
                    NodeOutcome::Failed { error, .. } => {
                        error!(task = %label, error = %error, "Task failed")
                    }
                    NodeOutcome::Cancelled => warn!(task = %label, "Task cancelled"),
                    NodeOutcome::Skipped { .. } => {}
                }
                outcomes.insert(id, outcome);
            }
            sink.phase_finished()?;
        }

        Ok(RunReport {
            outcomes,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

async fn run_node(
    graph: Arc<TaskGraph>,
    id: TaskId,
    sink: Arc<dyn TaskSink>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    work_root: PathBuf,
) -> NodeOutcome {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => {
                return NodeOutcome::Failed {
                    error: e.to_string(),
                    error_category: ErrorCategory::Infrastructure,
                }
            }
        },
        _ = cancel.cancelled() => return NodeOutcome::Cancelled,
    };

    let started = Instant::now();
    let result =
        tokio::task::spawn_blocking(move || execute_node(&graph, id, sink.as_ref(), &work_root, &cancel))
            .await;
    match result {
        Ok(Ok(())) => NodeOutcome::Completed {
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(OrchestratorError::Cancelled(_))) => NodeOutcome::Cancelled,
        Ok(Err(e)) => NodeOutcome::Failed {
            error: e.to_string(),
            error_category: e.category(),
        },
        Err(join_err) => NodeOutcome::Failed {
            error: format!("task panicked: {}", join_err),
            error_category: ErrorCategory::Infrastructure,
        },
    }
}

fn execute_node(
    graph: &TaskGraph,
    id: TaskId,
    sink: &dyn TaskSink,
    work_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let node = graph.node(id).ok_or_else(|| {
        OrchestratorError::MissingDependency(format!("task #{} is not in the graph", id.index()))
    })?;
    std::fs::create_dir_all(work_root)?;
    // Removed on drop, whichever way the node ends
    let work = tempfile::Builder::new()
        .prefix(&format!("{}-", node.pipeline.name()))
        .tempdir_in(work_root)?;
    let work_dir = work.path();
    let inputs = sink.load_inputs(node, work_dir)?;
    let outputs = node
        .workflow
        .execute(&inputs.values, &node.parameters, work_dir)?;
    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled(format!(
            "outputs of {} discarded",
            node.label()
        )));
    }
    sink.store_outputs(node, &inputs, outputs, work_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterValues;
    use crate::pipeline::{builder_fn, BuiltOutputs, PipelineSpec, RegisteredPipeline};
    use crate::workflow::{operation_fn, LazyValue};
    use cohort_core::{DataSpace, Dataset, SinkDefinition};
    use cohort_storage::{LeafEntry, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records stored nodes; refuses to load inputs for the rows in `broken`
    #[derive(Default)]
    struct RecordingSink {
        broken: Vec<String>,
        stored: Mutex<Vec<String>>,
        phases: AtomicUsize,
    }

    impl TaskSink for RecordingSink {
        fn load_inputs(&self, node: &TaskNode, work_dir: &Path) -> Result<LoadedInputs> {
            std::fs::write(work_dir.join("staged.txt"), node.label())?;
            if self.broken.contains(&node.row.id_string()) {
                return Err(OrchestratorError::task_failed(node.label(), "unreadable input"));
            }
            Ok(LoadedInputs::default())
        }

        fn store_outputs(
            &self,
            node: &TaskNode,
            _: &LoadedInputs,
            outputs: BTreeMap<String, TaskValue>,
            _: &Path,
        ) -> Result<()> {
            assert!(outputs.contains_key("out"));
            if let Ok(mut stored) = self.stored.lock() {
                stored.push(node.label());
            }
            Ok(())
        }

        fn phase_finished(&self) -> Result<()> {
            self.phases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dataset(scratch: &Path) -> Dataset {
        let store = Arc::new(MemoryStore::new(scratch));
        for sample in ["a", "b", "c"] {
            store.add_leaf("lab", LeafEntry::new([sample])).unwrap();
        }
        let mut dataset = Dataset::builder("lab", store, DataSpace::samples())
            .hierarchy(["sample"])
            .build()
            .unwrap();
        dataset
            .add_sink("out", SinkDefinition::default(), "sample", "field")
            .unwrap();
        dataset
    }

    fn node(dataset: &Dataset, sample: &str) -> TaskNode {
        let spec = PipelineSpec::new(
            "constant",
            builder_fn(|wf, _| {
                let op = operation_fn("one", |_, _| {
                    let mut outputs = BTreeMap::new();
                    outputs.insert("value".to_string(), TaskValue::Param(1.into()));
                    Ok(outputs)
                });
                let node = wf.add(op, Vec::<(String, LazyValue)>::new())?;
                let mut outputs = BuiltOutputs::new();
                outputs.insert("out".into(), node.output("value"));
                Ok(outputs)
            }),
        )
        .output("out");
        let pipeline = Arc::new(RegisteredPipeline {
            spec,
            frequency: dataset.frequency("sample").unwrap(),
        });
        let workflow = Arc::new(pipeline.build_workflow(&ParameterValues::new()).unwrap());
        TaskNode {
            pipeline,
            row: dataset.row("sample", &[sample]).unwrap(),
            inputs: Vec::new(),
            parameters: ParameterValues::new(),
            outputs: Vec::new(),
            requested: ["out".to_string()].into_iter().collect(),
            workflow,
        }
    }

    /// `a` and `b` feed `c`
    fn fan_in(scratch: &Path) -> (TaskGraph, [TaskId; 3]) {
        let dataset = dataset(scratch);
        let mut graph = TaskGraph::new();
        let a = graph.add_node(node(&dataset, "a"));
        let b = graph.add_node(node(&dataset, "b"));
        let c = graph.add_node(node(&dataset, "c"));
        graph.add_dependency(a, c).unwrap();
        graph.add_dependency(b, c).unwrap();
        (graph, [a, b, c])
    }

    #[test]
    fn test_failure_skips_dependants() {
        let scratch = tempfile::tempdir().unwrap();
        let (graph, [a, b, c]) = fan_in(scratch.path());
        let sink = Arc::new(RecordingSink {
            broken: vec!["b".to_string()],
            ..Default::default()
        });
        let work = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(2, work.path());

        let report = tokio_test::block_on(engine.run(
            Arc::new(graph),
            sink.clone(),
            CancellationToken::new(),
        ))
        .unwrap();

        assert!(matches!(report.outcome(a), Some(NodeOutcome::Completed { .. })));
        match report.outcome(b) {
            Some(NodeOutcome::Failed { error, error_category }) => {
                assert!(error.contains("unreadable input"));
                assert_eq!(*error_category, ErrorCategory::Permanent);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_eq!(
            report.outcome(c),
            Some(&NodeOutcome::Skipped {
                upstream: "constant@sample(b)".to_string()
            })
        );
        assert_eq!(report.completed(), 1);
        assert_eq!(sink.stored.lock().unwrap().as_slice(), ["constant@sample(a)"]);
    }

    #[test]
    fn test_work_dirs_removed_after_success_and_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let (graph, [a, b, _]) = fan_in(scratch.path());
        let sink = Arc::new(RecordingSink {
            broken: vec!["b".to_string()],
            ..Default::default()
        });
        let work = tempfile::tempdir().unwrap();
        let work_root = work.path().join("work");

        let report = tokio_test::block_on(LocalEngine::new(2, &work_root).run(
            Arc::new(graph),
            sink,
            CancellationToken::new(),
        ))
        .unwrap();

        assert!(matches!(report.outcome(a), Some(NodeOutcome::Completed { .. })));
        assert!(matches!(report.outcome(b), Some(NodeOutcome::Failed { .. })));
        assert_eq!(std::fs::read_dir(&work_root).unwrap().count(), 0);
    }

    #[test]
    fn test_sink_notified_after_each_phase() {
        let scratch = tempfile::tempdir().unwrap();
        let (graph, _) = fan_in(scratch.path());
        let sink = Arc::new(RecordingSink::default());
        let work = tempfile::tempdir().unwrap();

        let report = tokio_test::block_on(LocalEngine::new(2, work.path()).run(
            Arc::new(graph),
            sink.clone(),
            CancellationToken::new(),
        ))
        .unwrap();

        assert_eq!(report.completed(), 3);
        assert_eq!(sink.phases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancelled_before_start() {
        let scratch = tempfile::tempdir().unwrap();
        let (graph, [a, b, c]) = fan_in(scratch.path());
        let sink = Arc::new(RecordingSink::default());
        let work = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = tokio_test::block_on(LocalEngine::new(1, work.path()).run(
            Arc::new(graph),
            sink.clone(),
            cancel,
        ))
        .unwrap();

        assert_eq!(report.outcome(a), Some(&NodeOutcome::Cancelled));
        assert_eq!(report.outcome(b), Some(&NodeOutcome::Cancelled));
        assert!(matches!(report.outcome(c), Some(NodeOutcome::Skipped { .. })));
        assert!(sink.stored.lock().unwrap().is_empty());
    }
}
