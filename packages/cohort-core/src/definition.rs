//! Persisted dataset definitions
//!
//! A definition captures everything needed to rebuild a [`Dataset`] over the
//! same physical tree: the data space, hierarchy, id inference, filters and
//! columns. It is stored by the backing store as JSON, keyed by dataset id
//! and an optional name, and can also be exported to YAML.
//!
//! [`Dataset`]: crate::dataset::Dataset

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::column::{ColumnKind, ColumnSpec, SinkDefinition, SourceCriteria};
use crate::error::{DataError, Result};
use crate::filter::RowFilter;
use crate::inference::IdInference;
use crate::space::DataSpace;

/// Current definition schema version
pub const DEFINITION_VERSION: u32 = 1;

/// Serializable description of a data space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceDefinition {
    pub name: String,
    /// Axis names in bit order
    pub axes: Vec<String>,
    /// Names of every combination that is not a single axis
    pub frequencies: BTreeMap<String, Vec<String>>,
}

impl SpaceDefinition {
    pub fn from_space(space: &DataSpace) -> Result<Self> {
        let mut frequencies = BTreeMap::new();
        for freq in space.frequencies().filter(|f| !f.is_basis()) {
            let axes = freq
                .span()
                .into_iter()
                .map(|axis| space.name_of(axis).map(str::to_string))
                .collect::<Result<Vec<_>>>()?;
            frequencies.insert(space.name_of(freq)?.to_string(), axes);
        }
        Ok(Self {
            name: space.name().to_string(),
            axes: space.axis_names().to_vec(),
            frequencies,
        })
    }

    /// Built-in space of the same name when identical, otherwise a new one
    pub fn to_space(&self) -> Result<DataSpace> {
        let mut builder = DataSpace::builder(self.name.clone());
        for axis in &self.axes {
            builder = builder.axis(axis.clone());
        }
        for (name, axes) in &self.frequencies {
            let axes: Vec<&str> = axes.iter().map(String::as_str).collect();
            builder = builder.frequency(name.clone(), &axes);
        }
        let space = builder.build()?;
        match DataSpace::builtin(&self.name) {
            Some(builtin) if builtin == space => Ok(builtin),
            _ => Ok(space),
        }
    }
}

/// Persisted column; exactly one of `source` and `sink` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Frequency name within the dataset's space
    pub frequency: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkDefinition>,
}

impl ColumnDefinition {
    pub fn from_spec(spec: &ColumnSpec, space: &DataSpace) -> Result<Self> {
        let (source, sink) = match &spec.kind {
            ColumnKind::Source(criteria) => (Some(criteria.clone()), None),
            ColumnKind::Sink(sink) => (None, Some(sink.clone())),
        };
        Ok(Self {
            name: spec.name.clone(),
            frequency: space.name_of(spec.frequency)?.to_string(),
            format: spec.format.clone(),
            source,
            sink,
        })
    }

    pub fn to_spec(&self, space: &DataSpace) -> Result<ColumnSpec> {
        let kind = match (&self.source, &self.sink) {
            (Some(criteria), None) => ColumnKind::Source(criteria.clone()),
            (None, Some(sink)) => ColumnKind::Sink(sink.clone()),
            _ => {
                return Err(DataError::InvalidCriterion(format!(
                    "column '{}' must define exactly one of source or sink",
                    self.name
                )))
            }
        };
        Ok(ColumnSpec {
            name: self.name.clone(),
            frequency: space.parse(&self.frequency)?,
            format: self.format.clone(),
            kind,
        })
    }
}

/// Everything needed to rebuild a dataset over the same store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub version: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub space: SpaceDefinition,
    /// Frequency names of the layers, root to leaf
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub id_inference: Vec<IdInference>,
    #[serde(default)]
    pub include: Vec<RowFilter>,
    #[serde(default)]
    pub exclude: Vec<RowFilter>,
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
}

impl DatasetDefinition {
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let definition: Self = serde_json::from_value(value)?;
        definition.check_version()?;
        Ok(definition)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(content)?;
        definition.check_version()?;
        Ok(definition)
    }

    /// Why `other` cannot be stored over `self`, if it cannot
    pub fn conflict_with(&self, other: &DatasetDefinition) -> Option<String> {
        if self.space != other.space {
            return Some(format!(
                "stored space '{}' differs from '{}'",
                self.space.name, other.space.name
            ));
        }
        if self.hierarchy != other.hierarchy {
            return Some(format!(
                "stored hierarchy [{}] differs from [{}]",
                self.hierarchy.join(", "),
                other.hierarchy.join(", ")
            ));
        }
        None
    }

    fn check_version(&self) -> Result<()> {
        if self.version != DEFINITION_VERSION {
            return Err(DataError::UnsupportedDefinitionVersion(self.version));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Locators
// ═══════════════════════════════════════════════════════════════════════════

/// `<store>//<id>[@<name>]` address of a saved dataset
///
/// # Examples
///
/// ```rust
/// use cohort_core::definition::DatasetLocator;
///
/// let locator: DatasetLocator = "memory//study1@baseline".parse().unwrap();
/// assert_eq!(locator.store, "memory");
/// assert_eq!(locator.id, "study1");
/// assert_eq!(locator.name.as_deref(), Some("baseline"));
/// assert_eq!(locator.to_string(), "memory//study1@baseline");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetLocator {
    pub store: String,
    pub id: String,
    pub name: Option<String>,
}

impl DatasetLocator {
    pub fn new(store: impl Into<String>, id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            store: store.into(),
            id: id.into(),
            name,
        }
    }
}

impl fmt::Display for DatasetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}", self.store, self.id)?;
        if let Some(name) = &self.name {
            write!(f, "@{}", name)?;
        }
        Ok(())
    }
}

impl FromStr for DatasetLocator {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DataError::InvalidLocator(s.to_string());
        let (store, rest) = s.split_once("//").ok_or_else(invalid)?;
        let (id, name) = match rest.rsplit_once('@') {
            Some((id, name)) if !name.is_empty() => (id, Some(name.to_string())),
            Some(_) => return Err(invalid()),
            None => (rest, None),
        };
        if store.is_empty() || id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(store, id, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_space_definition_roundtrip() {
        let space = DataSpace::clinical();
        let definition = SpaceDefinition::from_space(&space).unwrap();
        assert_eq!(definition.axes, vec!["member", "group", "timepoint"]);
        assert_eq!(
            definition.frequencies["subject"],
            vec!["group".to_string(), "member".to_string()]
        );
        assert!(definition.frequencies.contains_key("dataset"));
        assert_eq!(definition.to_space().unwrap(), space);
    }

    #[test]
    fn test_custom_space_roundtrip() {
        let space = DataSpace::builder("plates")
            .axis("well")
            .axis("plate")
            .frequency("screen", &[])
            .frequency("sample", &["plate", "well"])
            .build()
            .unwrap();
        let definition = SpaceDefinition::from_space(&space).unwrap();
        let rebuilt = definition.to_space().unwrap();
        assert_eq!(rebuilt.name_of(rebuilt.root()).unwrap(), "screen");
        assert_eq!(rebuilt, space);
    }

    #[test]
    fn test_column_requires_exactly_one_kind() {
        let space = DataSpace::samples();
        let column = ColumnDefinition {
            name: "raw".into(),
            frequency: "sample".into(),
            format: "text".into(),
            source: None,
            sink: None,
        };
        assert!(matches!(
            column.to_spec(&space),
            Err(DataError::InvalidCriterion(_))
        ));
    }

    #[test]
    fn test_locator_parsing() {
        let plain: DatasetLocator = "memory//study".parse().unwrap();
        assert_eq!(plain.name, None);
        assert_eq!(plain.to_string(), "memory//study");

        for bad in ["memory", "//study", "memory//", "memory//study@"] {
            assert!(bad.parse::<DatasetLocator>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = r#"
version: 7
id: study
space:
  name: samples
  axes: [sample]
  frequencies:
    dataset: []
hierarchy: [sample]
"#;
        assert!(matches!(
            DatasetDefinition::from_yaml(yaml),
            Err(DataError::UnsupportedDefinitionVersion(7))
        ));
    }
}
