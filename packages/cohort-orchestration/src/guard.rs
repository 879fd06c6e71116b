//! Conditions selecting between alternative pipelines for one sink

use cohort_core::{DataRow, Dataset};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::parameter::ParameterValues;

/// What a guard can look at when evaluated for one row
pub struct GuardContext<'a> {
    pub dataset: &'a Dataset,
    pub row: &'a DataRow,
    pub parameters: &'a ParameterValues,
}

pub type RowPredicate = Arc<dyn Fn(&GuardContext<'_>) -> Result<bool> + Send + Sync>;

/// Condition under which a pipeline applies
#[derive(Clone, Default)]
pub enum Guard {
    /// Applies everywhere unless a conditional pipeline matches
    #[default]
    Always,
    /// Applies when a parameter has the given value
    ParamEquals { name: String, value: Value },
    /// Applies when a row-dependent switch evaluates true
    RowComputed { name: String, predicate: RowPredicate },
}

impl Guard {
    pub fn param_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Guard::ParamEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn row_computed<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&GuardContext<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        Guard::RowComputed {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_conditional(&self) -> bool {
        !matches!(self, Guard::Always)
    }

    /// Parameter the guard reads, if any
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Guard::ParamEquals { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn evaluate(&self, ctx: &GuardContext<'_>) -> Result<bool> {
        match self {
            Guard::Always => Ok(true),
            Guard::ParamEquals { name, value } => ctx
                .parameters
                .get(name)
                .map(|current| current == value)
                .ok_or_else(|| OrchestratorError::UnknownParameter(name.clone())),
            Guard::RowComputed { predicate, .. } => predicate(ctx),
        }
    }

    /// Whether both guards provably select the same rows
    ///
    /// Row-computed switches are opaque and never conflict statically.
    pub fn conflicts_with(&self, other: &Guard) -> bool {
        match (self, other) {
            (Guard::Always, Guard::Always) => true,
            (
                Guard::ParamEquals { name: a, value: x },
                Guard::ParamEquals { name: b, value: y },
            ) => a == b && x == y,
            _ => false,
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Always => write!(f, "always"),
            Guard::ParamEquals { name, value } => write!(f, "{} == {}", name, value),
            Guard::RowComputed { name, .. } => write!(f, "switch '{}'", name),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self)
    }
}
