//! Column specifications
//!
//! A column is a named, dataset-wide slice of comparable items across the
//! rows of one frequency. Source columns select existing items with
//! [`SourceCriteria`]; sink columns name where derived items are written.

use cohort_storage::Quality;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::space::Frequency;

/// Selection criteria of a source column
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceCriteria {
    /// Item path, or a regex matched against the whole path
    pub path: String,
    #[serde(default)]
    pub is_regex: bool,
    /// Minimum quality, applied when the store tracks quality
    #[serde(default)]
    pub quality_threshold: Option<Quality>,
    /// Required header values
    #[serde(default)]
    pub header: BTreeMap<String, serde_json::Value>,
    /// 1-based rank among the remaining candidates (by acquisition order)
    #[serde(default)]
    pub order: Option<u32>,
}

impl SourceCriteria {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            path: pattern.into(),
            is_regex: true,
            ..Default::default()
        }
    }

    pub fn with_quality(mut self, threshold: Quality) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Salience {
    #[default]
    Primary,
    Supplementary,
    Debug,
}

/// Destination of a sink column
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SinkDefinition {
    /// Item path written at each row; the column name when empty
    #[serde(default)]
    pub path: String,
    /// Pipeline expected to produce the column, if pinned
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub salience: Salience,
}

impl SinkDefinition {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_salience(mut self, salience: Salience) -> Self {
        self.salience = salience;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Source(SourceCriteria),
    Sink(SinkDefinition),
}

/// Named column of a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub frequency: Frequency,
    pub format: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn is_sink(&self) -> bool {
        matches!(self.kind, ColumnKind::Sink(_))
    }

    pub fn source_criteria(&self) -> Option<&SourceCriteria> {
        match &self.kind {
            ColumnKind::Source(criteria) => Some(criteria),
            ColumnKind::Sink(_) => None,
        }
    }

    pub fn sink_definition(&self) -> Option<&SinkDefinition> {
        match &self.kind {
            ColumnKind::Sink(sink) => Some(sink),
            ColumnKind::Source(_) => None,
        }
    }

    /// Item path written for sink columns
    pub fn sink_path(&self) -> Option<&str> {
        self.sink_definition().map(|sink| {
            if sink.path.is_empty() {
                self.name.as_str()
            } else {
                sink.path.as_str()
            }
        })
    }
}
