//! Registry mapping sink columns to the pipelines that produce them

use cohort_core::{Dataset, Frequency};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::guard::GuardContext;
use crate::pipeline::{PipelineSpec, RegisteredPipeline};

#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<RegisteredPipeline>>,
    /// Sink column -> names of the pipelines producing it, in registration order
    producers: HashMap<String, Vec<String>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `spec` against `dataset` and register it
    ///
    /// Rejects pipelines whose outputs are not sinks of a single frequency,
    /// whose inputs or formats cannot be satisfied, and pipelines that
    /// provably compete with an existing one for the same sink.
    pub fn register(&mut self, dataset: &Dataset, spec: PipelineSpec) -> Result<Arc<RegisteredPipeline>> {
        if self.pipelines.contains_key(&spec.name) {
            return Err(OrchestratorError::DuplicatePipeline(spec.name));
        }
        let frequency = self.output_frequency(dataset, &spec)?;
        self.check_inputs(dataset, &spec)?;
        if let Some(param) = spec.guard.parameter() {
            if !spec.parameters.iter().any(|p| p == param) {
                return Err(OrchestratorError::invalid_pipeline(
                    &spec.name,
                    format!("guard reads parameter '{}' which is not declared", param),
                ));
            }
        }

        for output in spec.output_columns() {
            let rivals: Vec<String> = self
                .pipelines_for(output)
                .into_iter()
                .filter(|other| {
                    other.spec.priority == spec.priority && other.spec.guard.conflicts_with(&spec.guard)
                })
                .map(|other| other.name().to_string())
                .collect();
            if !rivals.is_empty() {
                let mut candidates = rivals;
                candidates.push(spec.name.clone());
                return Err(OrchestratorError::AmbiguousPipeline {
                    sink: output.to_string(),
                    candidates,
                });
            }
        }

        let name = spec.name.clone();
        for output in spec.output_columns() {
            self.producers
                .entry(output.to_string())
                .or_default()
                .push(name.clone());
        }
        debug!(
            pipeline = %name,
            frequency = %frequency,
            guard = %spec.guard,
            "Registered pipeline"
        );
        let registered = Arc::new(RegisteredPipeline { spec, frequency });
        self.pipelines.insert(name, Arc::clone(&registered));
        Ok(registered)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<RegisteredPipeline>> {
        self.pipelines
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownPipeline(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredPipeline>> {
        self.pipelines.values()
    }

    /// Pipelines able to produce `sink`, in registration order
    pub fn pipelines_for(&self, sink: &str) -> Vec<Arc<RegisteredPipeline>> {
        self.producers
            .get(sink)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.pipelines.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The one pipeline producing `sink` at the row of `ctx`
    ///
    /// Conditional guards that match shadow unconditioned pipelines; among
    /// the remaining matches the highest priority wins.
    pub fn select(&self, sink: &str, ctx: &GuardContext<'_>) -> Result<Arc<RegisteredPipeline>> {
        let candidates = self.pipelines_for(sink);
        if candidates.is_empty() {
            return Err(OrchestratorError::NoApplicablePipeline {
                sink: sink.to_string(),
                row: ctx.row.to_string(),
                reason: "no pipeline produces it".to_string(),
            });
        }
        let mut matches = Vec::new();
        for candidate in candidates {
            if candidate.spec.guard.evaluate(ctx)? {
                matches.push(candidate);
            }
        }
        if matches.iter().any(|p| p.spec.guard.is_conditional()) {
            matches.retain(|p| p.spec.guard.is_conditional());
        }
        let top = match matches.iter().map(|p| p.spec.priority).max() {
            Some(top) => top,
            None => {
                return Err(OrchestratorError::NoApplicablePipeline {
                    sink: sink.to_string(),
                    row: ctx.row.to_string(),
                    reason: "no guard matched".to_string(),
                })
            }
        };
        matches.retain(|p| p.spec.priority == top);
        if matches.len() > 1 {
            return Err(OrchestratorError::AmbiguousPipeline {
                sink: sink.to_string(),
                candidates: matches.iter().map(|p| p.name().to_string()).collect(),
            });
        }
        matches.pop().ok_or_else(|| OrchestratorError::NoApplicablePipeline {
            sink: sink.to_string(),
            row: ctx.row.to_string(),
            reason: "no guard matched".to_string(),
        })
    }

    fn output_frequency(&self, dataset: &Dataset, spec: &PipelineSpec) -> Result<Frequency> {
        if spec.outputs.is_empty() {
            return Err(OrchestratorError::invalid_pipeline(&spec.name, "declares no outputs"));
        }
        let mut frequencies = Vec::new();
        for output in &spec.outputs {
            let column = dataset.column(&output.column)?;
            let sink = column.sink_definition().ok_or_else(|| {
                OrchestratorError::invalid_pipeline(
                    &spec.name,
                    format!("output '{}' is not a sink column", output.column),
                )
            })?;
            if let Some(pinned) = &sink.pipeline {
                if pinned != &spec.name {
                    return Err(OrchestratorError::invalid_pipeline(
                        &spec.name,
                        format!("sink '{}' is reserved for pipeline '{}'", output.column, pinned),
                    ));
                }
            }
            if let Some(format) = &output.format {
                dataset.formats().conversion_path(format, &column.format)?;
            }
            frequencies.push((output.column.as_str(), column.frequency));
        }
        let first = frequencies[0].1;
        if frequencies.iter().any(|(_, f)| *f != first) {
            let mut details = Vec::with_capacity(frequencies.len());
            for (column, f) in &frequencies {
                details.push(format!("{} at {}", column, dataset.space().name_of(*f)?));
            }
            return Err(OrchestratorError::InconsistentPipelineFrequency {
                pipeline: spec.name.clone(),
                details: details.join(", "),
            });
        }
        Ok(first)
    }

    fn check_inputs(&self, dataset: &Dataset, spec: &PipelineSpec) -> Result<()> {
        for input in &spec.inputs {
            if spec.produces(&input.column) {
                return Err(OrchestratorError::DagCycleDetected(format!(
                    "pipeline '{}' consumes its own output '{}'",
                    spec.name, input.column
                )));
            }
            let column = dataset.column(&input.column)?;
            if let Some(format) = &input.format {
                dataset.formats().conversion_path(&column.format, format)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Guard;
    use crate::parameter::ParameterValues;
    use crate::pipeline::{builder_fn, BuiltOutputs, PipelineBuilder};
    use cohort_core::{DataError, DataSpace, SinkDefinition, SourceCriteria};
    use cohort_storage::{LeafEntry, MemoryStore};
    use serde_json::json;

    fn noop() -> Arc<dyn PipelineBuilder> {
        builder_fn(|_, _| Ok(BuiltOutputs::new()))
    }

    fn dataset() -> (tempfile::TempDir, Dataset) {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(scratch.path()));
        store.add_leaf("study", LeafEntry::new(["g1", "s1"])).unwrap();
        let mut dataset = Dataset::builder("study", store, DataSpace::clinical())
            .hierarchy(["group", "subject"])
            .build()
            .unwrap();
        dataset
            .add_source("t1w", SourceCriteria::path("t1w"), "subject", "text")
            .unwrap();
        dataset
            .add_sink("mask", SinkDefinition::default(), "subject", "text")
            .unwrap();
        dataset
            .add_sink("report", SinkDefinition::default(), "subject", "text")
            .unwrap();
        dataset
            .add_sink("template", SinkDefinition::default(), "group", "text")
            .unwrap();
        (scratch, dataset)
    }

    #[test]
    fn test_mixed_output_frequencies_rejected_at_registration() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        let err = registry
            .register(
                &dataset,
                PipelineSpec::new("mixed", noop())
                    .input("t1w")
                    .output("mask")
                    .output("template"),
            )
            .unwrap_err();
        match err {
            OrchestratorError::InconsistentPipelineFrequency { pipeline, details } => {
                assert_eq!(pipeline, "mixed");
                assert_eq!(details, "mask at subject, template at group");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_outputs_must_be_sinks() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        let err = registry
            .register(&dataset, PipelineSpec::new("bad", noop()).output("t1w"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPipeline { .. }));

        let err = registry
            .register(&dataset, PipelineSpec::new("bad", noop()).input("nope").output("mask"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Data(DataError::UnknownColumn(_))));
    }

    #[test]
    fn test_unconditioned_rivals_are_ambiguous() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        registry
            .register(&dataset, PipelineSpec::new("bet", noop()).input("t1w").output("mask"))
            .unwrap();
        let err = registry
            .register(&dataset, PipelineSpec::new("synthstrip", noop()).input("t1w").output("mask"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AmbiguousPipeline { ref candidates, .. }
            if candidates == &vec!["bet".to_string(), "synthstrip".to_string()]));

        // a different priority is not ambiguous
        registry
            .register(
                &dataset,
                PipelineSpec::new("synthstrip", noop())
                    .input("t1w")
                    .output("mask")
                    .priority(1),
            )
            .unwrap();
        assert_eq!(registry.pipelines_for("mask").len(), 2);
    }

    #[test]
    fn test_select_prefers_matching_condition() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        registry
            .register(&dataset, PipelineSpec::new("bet", noop()).input("t1w").output("mask"))
            .unwrap();
        registry
            .register(
                &dataset,
                PipelineSpec::new("synthstrip", noop())
                    .input("t1w")
                    .output("mask")
                    .parameter("method")
                    .guard(Guard::param_equals("method", "deep")),
            )
            .unwrap();

        let row = dataset.row("subject", &["g1", "1"]).unwrap();
        let mut params = ParameterValues::new();
        params.insert("method".into(), json!("classic"));
        let ctx = GuardContext {
            dataset: &dataset,
            row: &row,
            parameters: &params,
        };
        assert_eq!(registry.select("mask", &ctx).unwrap().name(), "bet");

        params.insert("method".into(), json!("deep"));
        let ctx = GuardContext {
            dataset: &dataset,
            row: &row,
            parameters: &params,
        };
        assert_eq!(registry.select("mask", &ctx).unwrap().name(), "synthstrip");
    }

    #[test]
    fn test_select_without_match() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        registry
            .register(
                &dataset,
                PipelineSpec::new("only_controls", noop())
                    .input("t1w")
                    .output("mask")
                    .guard(Guard::row_computed("is_control", |ctx| {
                        Ok(ctx.row.label().starts_with("control"))
                    })),
            )
            .unwrap();
        let row = dataset.row("subject", &["g1", "1"]).unwrap();
        let params = ParameterValues::new();
        let ctx = GuardContext {
            dataset: &dataset,
            row: &row,
            parameters: &params,
        };
        assert!(matches!(
            registry.select("mask", &ctx),
            Err(OrchestratorError::NoApplicablePipeline { .. })
        ));
        assert!(matches!(
            registry.select("report", &ctx),
            Err(OrchestratorError::NoApplicablePipeline { ref reason, .. }) if reason.contains("no pipeline")
        ));
    }

    #[test]
    fn test_self_consuming_pipeline_is_a_cycle() {
        let (_scratch, dataset) = dataset();
        let mut registry = PipelineRegistry::new();
        let err = registry
            .register(&dataset, PipelineSpec::new("loop", noop()).input("mask").output("mask"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DagCycleDetected(_)));
    }
}
