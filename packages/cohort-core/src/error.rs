use cohort_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Error, Debug)]
pub enum DataError {
    // ═══════════════════════════════════════════════════════════════════════
    // Axis algebra and row model
    // ═══════════════════════════════════════════════════════════════════════
    #[error("Malformed data space '{space}': {reason}")]
    MalformedDataSpace { space: String, reason: String },

    #[error("Unknown frequency '{name}' in data space '{space}'")]
    UnknownFrequency { space: String, name: String },

    #[error("Could not infer ids from label '{label}' with pattern '{pattern}': {reason}")]
    IdInference {
        label: String,
        pattern: String,
        reason: String,
    },

    #[error("Inconsistent aggregation to '{frequency}': rows disagree on retained ids ({ids})")]
    InconsistentAggregation { frequency: String, ids: String },

    #[error("Could not construct data tree: {0}")]
    TreeConstruction(String),

    #[error("Row not found: {0}")]
    RowNotFound(String),

    #[error("Invalid row navigation: {0}")]
    InvalidNavigation(String),

    // ═══════════════════════════════════════════════════════════════════════
    // Dataset definition
    // ═══════════════════════════════════════════════════════════════════════
    #[error("Invalid hierarchy {hierarchy:?}: {reason}")]
    InvalidHierarchy {
        hierarchy: Vec<String>,
        reason: String,
    },

    #[error("Conflicting definition for dataset '{locator}': {reason}")]
    DatasetDefinitionConflict { locator: String, reason: String },

    #[error("Invalid dataset locator '{0}' (expected <store>//<id>[@<name>])")]
    InvalidLocator(String),

    #[error("Unsupported dataset definition version {0}")]
    UnsupportedDefinitionVersion(u32),

    #[error("Column '{0}' already exists (pass overwrite to replace it)")]
    DuplicateColumn(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Column '{column}' is at frequency '{expected}', not '{found}'")]
    WrongFrequency {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Unknown format '{0}'")]
    UnknownFormat(String),

    #[error("Invalid criterion: {0}")]
    InvalidCriterion(String),

    // ═══════════════════════════════════════════════════════════════════════
    // Column resolution
    // ═══════════════════════════════════════════════════════════════════════
    #[error(
        "Ambiguous match for column '{column}' in {row}: {} candidates ({}), set `order` to pick one",
        candidates.len(),
        candidates.join(", ")
    )]
    AmbiguousMatch {
        column: String,
        row: String,
        candidates: Vec<String>,
    },

    #[error("No matching item for column '{column}' in {row}: {reason}")]
    NoMatchingItem {
        column: String,
        row: String,
        reason: String,
    },

    #[error("Unsupported criterion '{criterion}': {reason}")]
    UnsupportedCriterion { criterion: String, reason: String },

    #[error("No conversion path from format '{from}' to '{to}'")]
    NoConversionPath { from: String, to: String },

    #[error("Conversion from '{from}' to '{to}' failed: {reason}")]
    Conversion {
        from: String,
        to: String,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Wrapped errors
    // ═══════════════════════════════════════════════════════════════════════
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DataError {
    pub fn malformed_space(space: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedDataSpace {
            space: space.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_hierarchy(hierarchy: &[String], reason: impl Into<String>) -> Self {
        Self::InvalidHierarchy {
            hierarchy: hierarchy.to_vec(),
            reason: reason.into(),
        }
    }

    pub fn no_match(
        column: impl Into<String>,
        row: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::NoMatchingItem {
            column: column.into(),
            row: row.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the contents of one row rather than by the
    /// dataset definition; callers isolate these per row.
    pub fn is_row_local(&self) -> bool {
        matches!(
            self,
            DataError::AmbiguousMatch { .. }
                | DataError::NoMatchingItem { .. }
                | DataError::InconsistentAggregation { .. }
                | DataError::RowNotFound(_)
                | DataError::NoConversionPath { .. }
                | DataError::Conversion { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_match_lists_candidates() {
        let err = DataError::AmbiguousMatch {
            column: "t1w".into(),
            row: "session(01)".into(),
            candidates: vec!["t1_mprage".into(), "t1_mprage_repeat".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 candidates"));
        assert!(msg.contains("t1_mprage, t1_mprage_repeat"));
        assert!(err.is_row_local());
    }

    #[test]
    fn test_definition_errors_are_not_row_local() {
        let err = DataError::invalid_hierarchy(&["group".into()], "does not cover leaf");
        assert!(!err.is_row_local());
        assert!(err.to_string().contains("does not cover leaf"));
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: DataError = StorageError::item_not_found("mem://x").into();
        assert_eq!(err.to_string(), "[item_not_found] Item not found: mem://x");
    }
}
