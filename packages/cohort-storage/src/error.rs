//! Error types for cohort-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Row locator does not exist in the store
    RowNotFound,
    /// Item descriptor does not resolve to stored data
    ItemNotFound,
    /// No dataset definition saved under the requested key
    DefinitionNotFound,
    /// Serialization/deserialization errors
    Serialization,
    /// Local cache slot errors (staging, commit, checksum side-car)
    Cache,
    /// Operation not supported by this adapter
    Unsupported,
    /// Write would clobber conflicting data
    Conflict,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RowNotFound => "row_not_found",
            ErrorKind::ItemNotFound => "item_not_found",
            ErrorKind::DefinitionNotFound => "definition_not_found",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Cache => "cache",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn row_not_found(locator: impl fmt::Display) -> Self {
        Self::new(ErrorKind::RowNotFound, format!("Row not found: {}", locator))
    }

    pub fn item_not_found(uri: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ItemNotFound,
            format!("Item not found: {}", uri.into()),
        )
    }

    pub fn definition_not_found(key: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DefinitionNotFound,
            format!("Dataset definition not found: {}", key.into()),
        )
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RowNotFound | ErrorKind::ItemNotFound | ErrorKind::DefinitionNotFound
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("I/O error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
