//! Task graph handed to execution engines
//!
//! One node per (pipeline, row) invocation, edges from upstream to
//! downstream invocations. Phases group nodes whose dependencies are all in
//! earlier phases so an engine can run each phase in parallel.

use cohort_core::{ConversionPath, DataRow, Frequency, RowKey};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::parameter::ParameterValues;
use crate::pipeline::RegisteredPipeline;
use crate::workflow::Workflow;

pub type TaskId = NodeIndex;

/// How one input column reaches the workflow
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub column: String,
    /// From the column format to the format the pipeline expects
    pub conversion: ConversionPath,
    /// Finer-frequency column, consumed as one item per related row
    pub sequence: bool,
}

/// How one produced value reaches its sink column
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub column: String,
    /// From the format the pipeline produces to the column format
    pub conversion: ConversionPath,
}

/// One pipeline invocation at one row
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub pipeline: Arc<RegisteredPipeline>,
    pub row: Arc<DataRow>,
    pub inputs: Vec<TaskInput>,
    /// Values of the parameters the pipeline declares
    pub parameters: ParameterValues,
    pub outputs: Vec<TaskOutput>,
    /// Sinks whose derivation asked for this invocation
    pub requested: BTreeSet<String>,
    pub workflow: Arc<Workflow>,
}

impl TaskNode {
    pub fn frequency(&self) -> Frequency {
        self.pipeline.frequency
    }

    pub fn row_key(&self) -> &RowKey {
        self.row.key()
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.pipeline.name(), self.row)
    }
}

/// DAG of task nodes
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<(String, RowKey), TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node`, or return the node already invoking the same pipeline at the same row
    pub fn add_node(&mut self, node: TaskNode) -> TaskId {
        let key = (node.pipeline.name().to_string(), node.row_key().clone());
        if let Some(&existing) = self.index.get(&key) {
            let requested = node.requested;
            self.graph[existing].requested.extend(requested);
            return existing;
        }
        let id = self.graph.add_node(node);
        self.index.insert(key, id);
        id
    }

    /// Record `sink` as requested from the invocation `id`
    pub fn add_request(&mut self, id: TaskId, sink: &str) {
        if let Some(node) = self.graph.node_weight_mut(id) {
            node.requested.insert(sink.to_string());
        }
    }

    pub fn find(&self, pipeline: &str, row: &RowKey) -> Option<TaskId> {
        self.index.get(&(pipeline.to_string(), row.clone())).copied()
    }

    /// Make `downstream` wait for `upstream`
    pub fn add_dependency(&mut self, upstream: TaskId, downstream: TaskId) -> Result<()> {
        for id in [upstream, downstream] {
            if self.graph.node_weight(id).is_none() {
                return Err(OrchestratorError::MissingDependency(format!(
                    "task #{} is not in the graph",
                    id.index()
                )));
            }
        }
        if upstream == downstream || has_path_connecting(&self.graph, downstream, upstream, None) {
            return Err(OrchestratorError::DagCycleDetected(format!(
                "{} depends on {}",
                self.graph[upstream].label(),
                self.graph[downstream].label()
            )));
        }
        self.graph.update_edge(upstream, downstream, ());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.graph.node_weight(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (TaskId, &TaskNode)> {
        self.graph
            .node_indices()
            .map(move |id| (id, &self.graph[id]))
    }

    /// Nodes `id` waits for
    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(id, Direction::Incoming)
            .collect();
        ids.sort();
        ids
    }

    /// Nodes waiting for `id`
    pub fn dependants(&self, id: TaskId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        ids.sort();
        ids
    }

    /// Topological sort with parallel group detection
    pub fn execution_phases(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .graph
            .node_indices()
            .map(|id| (id, self.dependencies(id).len()))
            .collect();

        let mut phases = Vec::new();
        while !in_degree.is_empty() {
            let mut ready: Vec<TaskId> = in_degree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&id, _)| id)
                .collect();
            if ready.is_empty() {
                return Err(OrchestratorError::DagCycleDetected(format!(
                    "{} tasks never become ready",
                    in_degree.len()
                )));
            }
            ready.sort();

            for id in &ready {
                in_degree.remove(id);
                for dependant in self.dependants(*id) {
                    if let Some(degree) = in_degree.get_mut(&dependant) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
            phases.push(ready);
        }
        Ok(phases)
    }

    /// Execution plan as a string (for logging)
    pub fn execution_plan(&self) -> Result<String> {
        let plan = self
            .execution_phases()?
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let labels: Vec<String> = group.iter().map(|id| self.graph[*id].label()).collect();
                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, labels.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, labels.join(""))
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(plan)
    }
}
