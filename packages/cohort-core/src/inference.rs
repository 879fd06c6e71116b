//! ID inference from composite labels
//!
//! Some stores encode several axis ids in one label (e.g. a session label
//! `MRH010_CONTROL03_MR02` carrying group, member and timepoint). An
//! [`IdInference`] rule decomposes the label of one hierarchy layer with a
//! regex whose named groups are axis names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DataError, Result};

/// Regex decomposition of the labels of one hierarchy layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdInference {
    /// Hierarchy layer whose label is decomposed
    pub source: String,
    /// Pattern with one named group per inferred axis
    pub pattern: String,
}

impl IdInference {
    pub fn new(source: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pattern: pattern.into(),
        }
    }

    /// Compile the pattern anchored to the whole label
    pub fn compile(&self) -> Result<CompiledInference> {
        let regex = Regex::new(&format!("^(?:{})$", self.pattern))?;
        let groups: Vec<String> = regex.capture_names().flatten().map(str::to_string).collect();
        if groups.is_empty() {
            return Err(DataError::InvalidCriterion(format!(
                "id inference pattern '{}' has no named groups",
                self.pattern
            )));
        }
        Ok(CompiledInference {
            rule: self.clone(),
            regex,
            groups,
        })
    }
}

/// [`IdInference`] with its regex compiled
#[derive(Debug, Clone)]
pub struct CompiledInference {
    rule: IdInference,
    regex: Regex,
    groups: Vec<String>,
}

impl CompiledInference {
    pub fn source(&self) -> &str {
        &self.rule.source
    }

    /// Axis names the rule infers
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Decompose `label` into axis ids
    ///
    /// Fails naming the label and the pattern when the label does not match
    /// or a named group does not participate in the match.
    pub fn infer(&self, label: &str) -> Result<BTreeMap<String, String>> {
        let captures = self
            .regex
            .captures(label)
            .ok_or_else(|| DataError::IdInference {
                label: label.to_string(),
                pattern: self.rule.pattern.clone(),
                reason: "label does not match".to_string(),
            })?;

        let mut ids = BTreeMap::new();
        for group in &self.groups {
            let value = captures.name(group).ok_or_else(|| DataError::IdInference {
                label: label.to_string(),
                pattern: self.rule.pattern.clone(),
                reason: format!("group '{}' did not match", group),
            })?;
            ids.insert(group.clone(), value.as_str().to_string());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_named_groups() {
        let rule = IdInference::new(
            "session",
            r"(?P<group>[A-Z]+)(?P<member>\d+)_MR(?P<timepoint>\d+)",
        )
        .compile()
        .unwrap();
        let ids = rule.infer("CONTROL03_MR02").unwrap();
        assert_eq!(ids["group"], "CONTROL");
        assert_eq!(ids["member"], "03");
        assert_eq!(ids["timepoint"], "02");
        assert_eq!(rule.groups().len(), 3);
    }

    #[test]
    fn test_no_match_names_label_and_pattern() {
        let rule = IdInference::new("session", r"(?P<timepoint>\d+)")
            .compile()
            .unwrap();
        let err = rule.infer("baseline").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("baseline"));
        assert!(msg.contains(r"(?P<timepoint>\d+)"));
    }

    #[test]
    fn test_match_is_anchored() {
        let rule = IdInference::new("session", r"MR(?P<timepoint>\d+)")
            .compile()
            .unwrap();
        assert!(rule.infer("XMR01").is_err());
        assert!(rule.infer("MR01").is_ok());
    }

    #[test]
    fn test_optional_group_missing() {
        let rule = IdInference::new("session", r"(?P<group>[A-Z]+)?(?P<member>\d+)")
            .compile()
            .unwrap();
        let err = rule.infer("03").unwrap_err();
        assert!(matches!(err, DataError::IdInference { ref reason, .. } if reason.contains("group")));
    }

    #[test]
    fn test_pattern_without_groups_rejected() {
        assert!(IdInference::new("session", r"\d+").compile().is_err());
        assert!(IdInference::new("session", r"(").compile().is_err());
    }
}
