use cohort_core::DataError;
use cohort_storage::{ErrorKind, StorageError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    // ═══════════════════════════════════════════════════════════════════════
    // Pipeline registration and selection
    // ═══════════════════════════════════════════════════════════════════════
    #[error("Pipeline '{pipeline}' has outputs at different frequencies: {details}")]
    InconsistentPipelineFrequency { pipeline: String, details: String },

    #[error("No applicable pipeline for sink '{sink}' at {row}: {reason}")]
    NoApplicablePipeline {
        sink: String,
        row: String,
        reason: String,
    },

    #[error("Ambiguous pipelines for sink '{sink}': {}", candidates.join(", "))]
    AmbiguousPipeline {
        sink: String,
        candidates: Vec<String>,
    },

    #[error("Invalid pipeline '{pipeline}': {reason}")]
    InvalidPipeline { pipeline: String, reason: String },

    #[error("Pipeline '{0}' is already registered")]
    DuplicatePipeline(String),

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Derivation
    // ═══════════════════════════════════════════════════════════════════════
    #[error("Upstream derivation of '{upstream}' at {row} failed: {reason}")]
    UpstreamDerivationFailed {
        upstream: String,
        row: String,
        reason: String,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("DAG cycle detected: {0}")]
    DagCycleDetected(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ═══════════════════════════════════════════════════════════════════════
    // Wrapped errors
    // ═══════════════════════════════════════════════════════════════════════
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn config<E: fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn task_failed(task: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::TaskFailed {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_pipeline(pipeline: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            pipeline: pipeline.into(),
            reason: reason.into(),
        }
    }

    /// How an external engine should treat the failure
    ///
    /// The planner itself never retries.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Io(_) => ErrorCategory::Infrastructure,
            OrchestratorError::Storage(e) | OrchestratorError::Data(DataError::Storage(e))
                if e.kind == ErrorKind::IO =>
            {
                ErrorCategory::Transient
            }
            OrchestratorError::Cancelled(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry policies of external engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Worth retrying (I/O hiccup, cancelled run)
    Transient,
    /// Retrying cannot help (ambiguous match, missing item, bad parameter)
    Permanent,
    /// Needs operator attention (disk full, permissions)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
