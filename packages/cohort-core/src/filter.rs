//! Include/exclude row filters
//!
//! A filter declared at frequency `G` hides rows at every frequency `F` with
//! `F ⊇ G` whose `G`-label fails it. Rows at frequencies that do not contain
//! `G` are never affected: excluding a subject hides its sessions but keeps
//! its group, unless the group is excluded explicitly too.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{DataError, Result};
use crate::space::{DataSpace, Frequency};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterCriterion {
    /// Exact labels
    Ids(Vec<String>),
    /// Regex matched against the whole label
    Pattern(String),
}

/// Filter on the labels of rows at one frequency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub frequency: String,
    pub criterion: FilterCriterion,
}

impl RowFilter {
    pub fn ids<I, S>(frequency: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frequency: frequency.into(),
            criterion: FilterCriterion::Ids(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn pattern(frequency: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            frequency: frequency.into(),
            criterion: FilterCriterion::Pattern(pattern.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
enum Matcher {
    Ids(HashSet<String>),
    Pattern(Regex),
}

/// Validated filter bound to a data space
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    kind: FilterKind,
    frequency: Frequency,
    matcher: Matcher,
}

impl CompiledFilter {
    /// Validate `filter` against the space and hierarchy of a dataset
    ///
    /// Exclusions must be declared at a hierarchy layer, where every row has
    /// a label of its own.
    pub fn compile(
        filter: &RowFilter,
        kind: FilterKind,
        space: &DataSpace,
        hierarchy: &[Frequency],
    ) -> Result<Self> {
        let frequency = space.parse(&filter.frequency)?;
        if kind == FilterKind::Exclude && !hierarchy.contains(&frequency) {
            return Err(DataError::InvalidCriterion(format!(
                "exclusion frequency '{}' is not a layer of the hierarchy",
                filter.frequency
            )));
        }
        let matcher = match &filter.criterion {
            FilterCriterion::Ids(ids) => Matcher::Ids(ids.iter().cloned().collect()),
            FilterCriterion::Pattern(pattern) => {
                Matcher::Pattern(Regex::new(&format!("^(?:{})$", pattern))?)
            }
        };
        Ok(Self {
            kind,
            frequency,
            matcher,
        })
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// Whether this filter constrains rows at `freq`
    pub fn applies_to(&self, freq: Frequency) -> bool {
        freq.is_superset(self.frequency)
    }

    pub fn matches(&self, label: &str) -> bool {
        match &self.matcher {
            Matcher::Ids(ids) => ids.contains(label),
            Matcher::Pattern(regex) => regex.is_match(label),
        }
    }

    /// Whether a row whose label at this filter's frequency is `label` passes
    pub fn admits(&self, label: Option<&str>) -> bool {
        let matched = label.map(|l| self.matches(l)).unwrap_or(false);
        match self.kind {
            FilterKind::Include => matched,
            FilterKind::Exclude => !matched,
        }
    }
}
