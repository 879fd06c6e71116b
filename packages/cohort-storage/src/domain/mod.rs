//! Domain layer for the store adapter contract
//!
//! # Domain Models
//!
//! - `RowLocator`: where a row lives in the store (primary tree or side branch)
//! - `LeafEntry`: one physical leaf listed by the store
//! - `ItemEntry`: descriptor of a file-set or field stored at a row
//! - `ItemValue`: the locally accessible content of an item
//! - `ProvenanceRecord`: fingerprint of the derivation that produced an item
//!
//! # Port Trait
//!
//! - `DataStore`: physical list/read/write operations consumed by datasets
//!
//! # Examples
//!
//! ```rust,ignore
//! use cohort_storage::domain::{DataStore, RowLocator};
//!
//! fn example(store: &dyn DataStore) -> cohort_storage::Result<()> {
//!     let hierarchy = vec!["subject".to_string(), "session".to_string()];
//!     for leaf in store.list_rows("my-study", &hierarchy)? {
//!         let row = RowLocator::tree(leaf.path.clone());
//!         for item in store.list_items("my-study", &row)? {
//!             let value = store.read_item("my-study", &item)?;
//!             println!("{} -> {:?}", item.path, value);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod checksum;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::Result;

pub use checksum::{digest_checksums, file_checksums, value_checksum};

/// Version stamped on every provenance record written by this crate
pub const PROVENANCE_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════

/// Location of a row inside a store
///
/// Rows whose frequency is a cumulative layer of the physical hierarchy live
/// in the primary tree, addressed by their labels from the root. Rows at any
/// other frequency are synthesized and live in a side-branch namespace keyed
/// by frequency name and ids, so derived items written to them never collide
/// with the primary tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowLocator {
    Tree { path: Vec<String> },
    SideBranch { frequency: String, ids: Vec<String> },
}

impl RowLocator {
    pub fn tree(path: Vec<String>) -> Self {
        RowLocator::Tree { path }
    }

    pub fn root() -> Self {
        RowLocator::Tree { path: Vec::new() }
    }

    pub fn side_branch(frequency: impl Into<String>, ids: Vec<String>) -> Self {
        RowLocator::SideBranch {
            frequency: frequency.into(),
            ids,
        }
    }

    pub fn is_side_branch(&self) -> bool {
        matches!(self, RowLocator::SideBranch { .. })
    }

    /// Stable string key, distinct between tree rows and side-branch rows
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cohort_storage::domain::RowLocator;
    ///
    /// let row = RowLocator::tree(vec!["sub01".into(), "ses01".into()]);
    /// assert_eq!(row.namespace(), "sub01/ses01");
    ///
    /// let synth = RowLocator::side_branch("timepoint", vec!["1".into()]);
    /// assert_eq!(synth.namespace(), "__timepoint__/1");
    /// ```
    pub fn namespace(&self) -> String {
        match self {
            RowLocator::Tree { path } => path.join("/"),
            RowLocator::SideBranch { frequency, ids } => {
                format!("__{}__/{}", frequency, ids.join("."))
            }
        }
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowLocator::Tree { path } if path.is_empty() => write!(f, "<root>"),
            _ => write!(f, "{}", self.namespace()),
        }
    }
}

/// Physical leaf of the hierarchy as listed by a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    /// Labels from the root down to the leaf, one per hierarchy layer
    pub path: Vec<String>,
    /// Store-provided metadata usable for id inference
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LeafEntry {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Items
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    FileSet,
    Field,
}

/// Quality rating attached to items by stores that track it
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Unusable = 0,
    Artefactual = 25,
    Questionable = 50,
    Noisy = 75,
    #[default]
    Usable = 100,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Unusable => "unusable",
            Quality::Artefactual => "artefactual",
            Quality::Questionable => "questionable",
            Quality::Noisy => "noisy",
            Quality::Usable => "usable",
        }
    }

    pub fn score(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor of one physical item at a row
///
/// Entries are references: the content is only pulled by
/// [`DataStore::read_item`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEntry {
    /// Path of the item relative to its row (e.g. `anat/t1_mprage`)
    pub path: String,
    /// Store-specific address of the item
    pub uri: String,
    pub kind: ItemKind,
    /// Format name, resolved against the format registry of the dataset
    pub format: String,
    /// Acquisition rank within the row, lower was acquired earlier
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub quality: Option<Quality>,
    /// Header values for formats that support header introspection
    #[serde(default)]
    pub header: BTreeMap<String, serde_json::Value>,
    /// Per-file (or per-value) SHA-256 checksums
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl ItemEntry {
    pub fn new(
        path: impl Into<String>,
        uri: impl Into<String>,
        kind: ItemKind,
        format: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            uri: uri.into(),
            kind,
            format: format.into(),
            order: None,
            quality: None,
            header: BTreeMap::new(),
            checksums: BTreeMap::new(),
        }
    }

    /// Quality with absent ratings treated as usable
    pub fn effective_quality(&self) -> Quality {
        self.quality.unwrap_or_default()
    }

    /// Single digest over all checksums of the item
    pub fn digest(&self) -> String {
        digest_checksums(&self.checksums)
    }
}

/// Locally accessible content of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ItemValue {
    FileSet(Vec<PathBuf>),
    Field(serde_json::Value),
}

impl ItemValue {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemValue::FileSet(_) => ItemKind::FileSet,
            ItemValue::Field(_) => ItemKind::Field,
        }
    }

    pub fn paths(&self) -> Option<&[PathBuf]> {
        match self {
            ItemValue::FileSet(paths) => Some(paths),
            ItemValue::Field(_) => None,
        }
    }

    pub fn as_field(&self) -> Option<&serde_json::Value> {
        match self {
            ItemValue::Field(value) => Some(value),
            ItemValue::FileSet(_) => None,
        }
    }

    /// Per-file checksums of a file-set, or a single `value` checksum of a field
    pub fn checksums(&self) -> Result<BTreeMap<String, String>> {
        match self {
            ItemValue::FileSet(paths) => file_checksums(paths),
            ItemValue::Field(value) => {
                let mut map = BTreeMap::new();
                map.insert("value".to_string(), value_checksum(value)?);
                Ok(map)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Provenance
// ═══════════════════════════════════════════════════════════════════════════

/// Fingerprint of the derivation that produced an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub pipeline: String,
    /// Values of the parameters the pipeline declares
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Input column -> digests of the consumed items, in consumption order
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<String>>,
    /// Output column -> digest of the produced item
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

impl ProvenanceRecord {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            parameters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            created_at: Utc::now(),
            version: PROVENANCE_VERSION,
        }
    }

    /// Compare everything but timestamp and version
    pub fn fingerprint_matches(&self, other: &ProvenanceRecord) -> bool {
        self.pipeline == other.pipeline
            && self.parameters == other.parameters
            && self.inputs == other.inputs
            && self.outputs == other.outputs
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Optional introspection features of a store
///
/// Stores lacking a capability declare it absent; the resolution engine
/// treats quality filters as no-ops and rejects header criteria up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    pub quality: bool,
    pub headers: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            quality: true,
            headers: true,
        }
    }
}

impl StoreCapabilities {
    pub fn none() -> Self {
        Self {
            quality: false,
            headers: false,
        }
    }
}

/// Physical read/write/list contract consumed by datasets
///
/// Concrete backends (file system, archive APIs) implement this trait; the
/// data layer never touches storage any other way. Implementations must be
/// safe to share across threads.
pub trait DataStore: Send + Sync {
    /// Short name used in dataset locators (`<store>//<dataset id>`)
    fn name(&self) -> &str;

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default()
    }

    /// List every leaf of the dataset for the given hierarchy
    fn list_rows(&self, dataset_id: &str, hierarchy: &[String]) -> Result<Vec<LeafEntry>>;

    /// List descriptors of all items stored at a row
    fn list_items(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<ItemEntry>>;

    /// Pull an item to local storage, returning local path(s) or the field value
    fn read_item(&self, dataset_id: &str, entry: &ItemEntry) -> Result<ItemValue>;

    /// Store an item at a row, replacing any item with the same path
    fn write_item(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        path: &str,
        format: &str,
        value: &ItemValue,
    ) -> Result<ItemEntry>;

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
    ) -> Result<Option<ProvenanceRecord>>;

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
        record: &ProvenanceRecord,
    ) -> Result<()>;

    /// Drop a provenance record; missing records are not an error
    fn remove_provenance(&self, dataset_id: &str, row: &RowLocator, column: &str) -> Result<()>;

    /// Persist a dataset definition under (dataset id, optional name)
    fn save_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
        definition: &serde_json::Value,
    ) -> Result<()>;

    fn load_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
    ) -> Result<Option<serde_json::Value>>;
}
