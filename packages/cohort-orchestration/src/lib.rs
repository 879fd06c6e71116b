/*
 * cohort-orchestration - Derivation planning for cohort datasets
 *
 * Architecture:
 * - Pipeline registry (sink column -> guarded pipelines)
 * - Analysis templates (columns, parameters, pipelines; composed by merge)
 * - Planner (per (sink, row) state machine, provenance checks)
 * - Task graph (one node per pipeline invocation, parallel phases)
 * - Execution hand-off (pluggable engines, local tokio engine)
 */

pub mod analysis;
pub mod deriver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod guard;
pub mod parameter;
pub mod pipeline;
pub mod planner;
pub mod provenance;
pub mod registry;
pub mod report;
pub mod state;
pub mod telemetry;
pub mod workflow;

// Re-exports
pub use analysis::{Analysis, AnalysisTemplate, TemplateColumn};
pub use deriver::{DatasetSink, Deriver};
pub use engine::{ExecutionEngine, LoadedInputs, LocalEngine, NodeOutcome, RunReport, TaskSink};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use graph::{TaskGraph, TaskId, TaskInput, TaskNode, TaskOutput};
pub use guard::{Guard, GuardContext, RowPredicate};
pub use parameter::{ParameterSpec, ParameterValues};
pub use pipeline::{
    builder_fn, BuilderArgs, BuiltOutputs, PipelineBuilder, PipelineInput, PipelineOutput,
    PipelineSpec, RegisteredPipeline,
};
pub use planner::{DerivationKey, DerivationPlan, DerivationPlanner, PlanSummary};
pub use provenance::{Fingerprint, Staleness};
pub use registry::PipelineRegistry;
pub use report::{DerivationReport, DerivationStatus, ReportEntry};
pub use state::{DerivationState, DerivationStateMachine};
pub use workflow::{operation_fn, LazyValue, NodeHandle, Operation, TaskValue, Workflow, WorkflowBuilder};

// Cancellation primitive engines honour
pub use tokio_util::sync::CancellationToken;
