//! Analyses: parameters and pipelines applied to a dataset
//!
//! An [`AnalysisTemplate`] is a plain value: the columns an analysis needs,
//! the parameters it exposes and the pipelines deriving its sinks. Templates
//! compose by explicit [`AnalysisTemplate::merge`], where members of the
//! merged-in template replace same-named ones. Applying a template to a
//! dataset yields an [`Analysis`], which owns the pipeline registry and the
//! current parameter values.

use cohort_core::{DataError, Dataset, SinkDefinition, SourceCriteria};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::parameter::{resolve_values, ParameterSpec, ParameterValues};
use crate::pipeline::{PipelineSpec, RegisteredPipeline};
use crate::registry::PipelineRegistry;

/// Column an analysis expects on the dataset it is applied to
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateColumn {
    /// Must already exist on the dataset
    Source {
        name: String,
        criteria: SourceCriteria,
        frequency: String,
        format: String,
    },
    /// Added to the dataset when missing
    Sink {
        name: String,
        definition: SinkDefinition,
        frequency: String,
        format: String,
    },
}

impl TemplateColumn {
    pub fn name(&self) -> &str {
        match self {
            TemplateColumn::Source { name, .. } | TemplateColumn::Sink { name, .. } => name,
        }
    }

    pub fn frequency(&self) -> &str {
        match self {
            TemplateColumn::Source { frequency, .. } | TemplateColumn::Sink { frequency, .. } => {
                frequency
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisTemplate {
    pub name: String,
    pub columns: BTreeMap<String, TemplateColumn>,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub pipelines: BTreeMap<String, PipelineSpec>,
}

impl AnalysisTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn source(
        mut self,
        name: impl Into<String>,
        criteria: SourceCriteria,
        frequency: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.columns.insert(
            name.clone(),
            TemplateColumn::Source {
                name,
                criteria,
                frequency: frequency.into(),
                format: format.into(),
            },
        );
        self
    }

    pub fn sink(
        mut self,
        name: impl Into<String>,
        definition: SinkDefinition,
        frequency: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.columns.insert(
            name.clone(),
            TemplateColumn::Sink {
                name,
                definition,
                frequency: frequency.into(),
                format: format.into(),
            },
        );
        self
    }

    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.insert(spec.name.clone(), spec);
        self
    }

    pub fn pipeline(mut self, spec: PipelineSpec) -> Self {
        self.pipelines.insert(spec.name.clone(), spec);
        self
    }

    /// Compose `other` into this template, last merge wins
    pub fn merge(mut self, other: AnalysisTemplate) -> Self {
        for (name, column) in other.columns {
            if self.columns.insert(name.clone(), column).is_some() {
                info!(template = %other.name, column = %name, "Overriding template column");
            }
        }
        for (name, spec) in other.parameters {
            if self.parameters.insert(name.clone(), spec).is_some() {
                info!(template = %other.name, parameter = %name, "Overriding template parameter");
            }
        }
        for (name, spec) in other.pipelines {
            if self.pipelines.insert(name.clone(), spec).is_some() {
                info!(template = %other.name, pipeline = %name, "Overriding template pipeline");
            }
        }
        if !other.name.is_empty() {
            self.name = other.name;
        }
        self
    }

    /// Bind the template to `dataset`
    ///
    /// Sources must already exist at the declared frequency; missing sinks
    /// are added. Parameter values are the defaults overlaid with `overrides`.
    pub fn apply(&self, dataset: &mut Dataset, overrides: &ParameterValues) -> Result<Analysis> {
        for column in self.columns.values() {
            match column {
                TemplateColumn::Source { name, .. } => {
                    let existing = dataset.column(name)?;
                    if existing.is_sink() {
                        return Err(DataError::InvalidCriterion(format!(
                            "analysis '{}' expects '{}' to be a source column",
                            self.name, name
                        ))
                        .into());
                    }
                    check_frequency(dataset, name, column.frequency())?;
                }
                TemplateColumn::Sink {
                    name,
                    definition,
                    frequency,
                    format,
                } => {
                    if dataset.has_column(name) {
                        if !dataset.column(name)?.is_sink() {
                            return Err(DataError::InvalidCriterion(format!(
                                "analysis '{}' expects '{}' to be a sink column",
                                self.name, name
                            ))
                            .into());
                        }
                        check_frequency(dataset, name, frequency)?;
                    } else {
                        dataset.add_sink(name.clone(), definition.clone(), frequency, format.clone())?;
                        debug!(analysis = %self.name, column = %name, "Added template sink");
                    }
                }
            }
        }

        let mut analysis = Analysis::new(self.name.clone());
        analysis.parameters = resolve_values(&self.parameters, overrides)?;
        analysis.parameter_specs = self.parameters.clone();
        for spec in self.pipelines.values() {
            analysis.register_pipeline(dataset, spec.clone())?;
        }
        info!(
            analysis = %self.name,
            pipelines = analysis.registry.len(),
            parameters = analysis.parameters.len(),
            "Applied analysis template"
        );
        Ok(analysis)
    }
}

fn check_frequency(dataset: &Dataset, column: &str, expected: &str) -> Result<()> {
    let spec = dataset.column(column)?;
    if spec.frequency != dataset.frequency(expected)? {
        return Err(DataError::WrongFrequency {
            column: column.to_string(),
            expected: expected.to_string(),
            found: dataset.space().name_of(spec.frequency)?.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Pipelines and parameter values bound to one dataset
#[derive(Debug, Default)]
pub struct Analysis {
    name: String,
    registry: PipelineRegistry,
    parameter_specs: BTreeMap<String, ParameterSpec>,
    parameters: ParameterValues,
}

impl Analysis {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a parameter, set to its default
    pub fn add_parameter(&mut self, spec: ParameterSpec) -> Result<()> {
        spec.validate(&spec.default)?;
        self.parameters.insert(spec.name.clone(), spec.default.clone());
        if self.parameter_specs.insert(spec.name.clone(), spec).is_some() {
            info!(analysis = %self.name, "Replaced parameter declaration");
        }
        Ok(())
    }

    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let spec = self
            .parameter_specs
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownParameter(name.to_string()))?;
        let value = value.into();
        spec.validate(&value)?;
        debug!(analysis = %self.name, parameter = name, value = %value, "Set parameter");
        self.parameters.insert(name.to_string(), value);
        Ok(())
    }

    /// Register a pipeline whose declared parameters all exist on this analysis
    pub fn register_pipeline(
        &mut self,
        dataset: &Dataset,
        spec: PipelineSpec,
    ) -> Result<Arc<RegisteredPipeline>> {
        if let Some(unknown) = spec
            .parameters
            .iter()
            .find(|name| !self.parameter_specs.contains_key(*name))
        {
            return Err(OrchestratorError::UnknownParameter(format!(
                "{} (declared by pipeline '{}')",
                unknown, spec.name
            )));
        }
        self.registry.register(dataset, spec)
    }

    pub fn parameters(&self) -> &ParameterValues {
        &self.parameters
    }

    pub fn parameter_spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameter_specs.get(name)
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{builder_fn, BuiltOutputs, PipelineBuilder};
    use cohort_core::DataSpace;
    use cohort_storage::{LeafEntry, MemoryStore};
    use serde_json::json;

    fn noop() -> Arc<dyn PipelineBuilder> {
        builder_fn(|_, _| Ok(BuiltOutputs::new()))
    }

    fn dataset() -> (tempfile::TempDir, Dataset) {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(scratch.path()));
        store.add_leaf("lab", LeafEntry::new(["a"])).unwrap();
        let mut dataset = Dataset::builder("lab", store, DataSpace::samples())
            .hierarchy(["sample"])
            .build()
            .unwrap();
        dataset
            .add_source("raw", SourceCriteria::path("raw"), "sample", "text")
            .unwrap();
        (scratch, dataset)
    }

    fn base() -> AnalysisTemplate {
        AnalysisTemplate::new("base")
            .source("raw", SourceCriteria::path("raw"), "sample", "text")
            .sink("smoothed", SinkDefinition::default(), "sample", "text")
            .parameter(ParameterSpec::new("width", 3).with_bounds(1.0, 9.0))
            .pipeline(
                PipelineSpec::new("smooth", noop())
                    .input("raw")
                    .output("smoothed")
                    .parameter("width"),
            )
    }

    #[test]
    fn test_merge_last_wins() {
        let extension = AnalysisTemplate::new("wide")
            .parameter(ParameterSpec::new("width", 7).with_bounds(1.0, 9.0))
            .sink("summary", SinkDefinition::default(), "dataset", "text");
        let merged = base().merge(extension);

        assert_eq!(merged.name, "wide");
        assert_eq!(merged.parameters["width"].default, json!(7));
        assert_eq!(merged.columns.len(), 3);
        assert!(merged.pipelines.contains_key("smooth"));
    }

    #[test]
    fn test_apply_adds_sinks_and_resolves_parameters() {
        let (_scratch, mut dataset) = dataset();
        let mut overrides = ParameterValues::new();
        overrides.insert("width".into(), json!(5));

        let analysis = base().apply(&mut dataset, &overrides).unwrap();
        assert!(dataset.column("smoothed").unwrap().is_sink());
        assert_eq!(analysis.parameters()["width"], json!(5));
        assert_eq!(analysis.registry().len(), 1);
    }

    #[test]
    fn test_apply_rejects_invalid_override() {
        let (_scratch, mut dataset) = dataset();
        let mut overrides = ParameterValues::new();
        overrides.insert("width".into(), json!(12));
        assert!(matches!(
            base().apply(&mut dataset, &overrides),
            Err(OrchestratorError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_apply_requires_sources() {
        let (_scratch, mut dataset) = dataset();
        let template = base().source("missing", SourceCriteria::path("x"), "sample", "text");
        assert!(matches!(
            template.apply(&mut dataset, &ParameterValues::new()),
            Err(OrchestratorError::Data(DataError::UnknownColumn(_)))
        ));

        let template = AnalysisTemplate::new("coarse").source(
            "raw",
            SourceCriteria::path("raw"),
            "dataset",
            "text",
        );
        assert!(matches!(
            template.apply(&mut dataset, &ParameterValues::new()),
            Err(OrchestratorError::Data(DataError::WrongFrequency { .. }))
        ));
    }

    #[test]
    fn test_pipeline_parameters_must_be_declared() {
        let (_scratch, mut dataset) = dataset();
        let mut analysis = Analysis::new("adhoc");
        dataset
            .add_sink("smoothed", SinkDefinition::default(), "sample", "text")
            .unwrap();
        let spec = PipelineSpec::new("smooth", noop())
            .input("raw")
            .output("smoothed")
            .parameter("width");
        assert!(matches!(
            analysis.register_pipeline(&dataset, spec.clone()),
            Err(OrchestratorError::UnknownParameter(_))
        ));

        analysis.add_parameter(ParameterSpec::new("width", 3)).unwrap();
        analysis.register_pipeline(&dataset, spec).unwrap();
        analysis.set_parameter("width", 4).unwrap();
        assert_eq!(analysis.parameters()["width"], json!(4));
        assert!(analysis.set_parameter("depth", 1).is_err());
    }
}
