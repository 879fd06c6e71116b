//! cohort-core - Dataset addressing over hierarchical stores
//!
//! ## Layers
//!
//! 1. **Axis algebra** ([`space`]): frequencies as bitmasks over named axes
//! 2. **Row model** ([`row`], [`tree`], [`inference`], [`filter`]): rows at any
//!    frequency, projected from the physical leaves of a store
//! 3. **Datasets** ([`dataset`], [`definition`]): hierarchy, filters and
//!    columns, persisted as definitions
//! 4. **Resolution** ([`column`], [`resolve`], [`format`]): which item a
//!    column refers to at a row, and how to convert it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cohort_core::{Dataset, DataSpace, SourceCriteria};
//! use cohort_storage::MemoryStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new("/tmp/scratch"));
//! let mut dataset = Dataset::builder("study", store, DataSpace::samples())
//!     .hierarchy(["sample"])
//!     .build()?;
//! dataset.add_source("raw", SourceCriteria::path("raw"), "sample", "text")?;
//! for row in dataset.rows("sample")? {
//!     println!("{}: {}", row, dataset.resolve(&row, "raw")?.entry.uri);
//! }
//! ```

pub mod column;
pub mod config;
pub mod dataset;
pub mod definition;
pub mod error;
pub mod filter;
pub mod format;
pub mod inference;
pub mod resolve;
pub mod row;
pub mod space;
pub mod tree;

pub use column::{ColumnKind, ColumnSpec, Salience, SinkDefinition, SourceCriteria};
pub use config::{CohortConfig, ConfigError, ConfigResult, OrderTieBreak};
pub use dataset::{Dataset, DatasetBuilder};
pub use definition::{DatasetDefinition, DatasetLocator};
pub use error::{DataError, Result};
pub use filter::{FilterCriterion, RowFilter};
pub use format::{converter_fn, ConversionPath, Converter, FormatInfo, FormatRegistry};
pub use inference::IdInference;
pub use resolve::{ColumnResolver, ResolvedInput, ResolvedItem};
pub use row::{DataRow, RowKey};
pub use space::{DataSpace, Frequency};
pub use tree::DataTree;
