//! In-memory store adapter
//!
//! Reference implementation of [`DataStore`]. Leaves, item descriptors,
//! provenance records and definitions live in memory; file-set content is
//! copied into a scratch directory so that reads hand back real local paths.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::fs_util::{copy_recursively, sanitize};
use crate::domain::{
    DataStore, ItemEntry, ItemValue, LeafEntry, ProvenanceRecord, RowLocator, StoreCapabilities,
};
use crate::{Result, StorageError};

struct StoredItem {
    entry: ItemEntry,
    value: ItemValue,
}

#[derive(Default)]
struct MemoryDataset {
    leaves: Vec<LeafEntry>,
    items: HashMap<RowLocator, Vec<StoredItem>>,
    provenance: HashMap<(RowLocator, String), ProvenanceRecord>,
}

impl MemoryDataset {
    fn has_row(&self, row: &RowLocator) -> bool {
        match row {
            RowLocator::Tree { path } => {
                path.is_empty() || self.leaves.iter().any(|leaf| leaf.path.starts_with(path))
            }
            RowLocator::SideBranch { .. } => true,
        }
    }
}

/// In-memory store
pub struct MemoryStore {
    name: String,
    scratch: PathBuf,
    capabilities: StoreCapabilities,
    datasets: RwLock<HashMap<String, MemoryDataset>>,
    definitions: RwLock<HashMap<(String, Option<String>), serde_json::Value>>,
    reads: AtomicUsize,
    listings: AtomicUsize,
}

impl MemoryStore {
    /// Create a store whose file-set content is kept under `scratch`
    pub fn new(scratch: impl Into<PathBuf>) -> Self {
        Self {
            name: "memory".to_string(),
            scratch: scratch.into(),
            capabilities: StoreCapabilities::default(),
            datasets: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: StoreCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Register a physical leaf of a dataset
    pub fn add_leaf(&self, dataset_id: &str, leaf: LeafEntry) -> Result<()> {
        let mut datasets = self.datasets.write();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        if dataset.leaves.iter().any(|l| l.path == leaf.path) {
            return Err(StorageError::conflict(format!(
                "Leaf {} already exists in {}",
                leaf.path.join("/"),
                dataset_id
            )));
        }
        dataset.leaves.push(leaf);
        Ok(())
    }

    /// Add an item, ranked after the items already present at the row
    pub fn add_item(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        path: &str,
        format: &str,
        value: ItemValue,
    ) -> Result<ItemEntry> {
        let entry = ItemEntry::new(path, "", value.kind(), format);
        self.insert_item(dataset_id, row, entry, value)
    }

    /// Add an item keeping the order, quality and header of `entry`
    ///
    /// The uri and checksums are filled in by the store.
    pub fn insert_item(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        mut entry: ItemEntry,
        value: ItemValue,
    ) -> Result<ItemEntry> {
        let value = self.materialize(dataset_id, row, &entry.path, value)?;
        entry.uri = item_uri(dataset_id, row, &entry.path);
        entry.kind = value.kind();
        entry.checksums = value.checksums()?;

        let mut datasets = self.datasets.write();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        if !dataset.has_row(row) {
            return Err(StorageError::row_not_found(row));
        }
        let items = dataset.items.entry(row.clone()).or_default();
        match items.iter_mut().find(|i| i.entry.path == entry.path) {
            Some(existing) => {
                if entry.order.is_none() {
                    entry.order = existing.entry.order;
                }
                existing.entry = entry.clone();
                existing.value = value;
            }
            None => {
                if entry.order.is_none() {
                    entry.order = Some(items.len() as u32 + 1);
                }
                items.push(StoredItem {
                    entry: entry.clone(),
                    value,
                });
            }
        }
        debug!(dataset = dataset_id, row = %row, item = %entry.path, "Stored item");
        Ok(entry)
    }

    /// Number of `read_item` calls served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `list_rows` calls served so far
    pub fn list_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    fn materialize(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        path: &str,
        value: ItemValue,
    ) -> Result<ItemValue> {
        let paths = match value {
            ItemValue::Field(_) => return Ok(value),
            ItemValue::FileSet(paths) => paths,
        };
        let dest_dir = self
            .scratch
            .join(sanitize(dataset_id))
            .join(sanitize(&row.namespace()))
            .join(sanitize(path));
        if paths.iter().any(|p| p.starts_with(&dest_dir)) {
            return Ok(ItemValue::FileSet(paths));
        }
        if dest_dir.exists() {
            fs::remove_dir_all(&dest_dir)?;
        }
        fs::create_dir_all(&dest_dir)?;

        let mut copied = Vec::with_capacity(paths.len());
        for source in &paths {
            let name = source
                .file_name()
                .ok_or_else(|| StorageError::item_not_found(source.to_string_lossy()))?;
            let dest = dest_dir.join(name);
            copy_recursively(source, &dest)?;
            copied.push(dest);
        }
        Ok(ItemValue::FileSet(copied))
    }
}

impl DataStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    fn list_rows(&self, dataset_id: &str, _hierarchy: &[String]) -> Result<Vec<LeafEntry>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let datasets = self.datasets.read();
        Ok(datasets
            .get(dataset_id)
            .map(|d| d.leaves.clone())
            .unwrap_or_default())
    }

    fn list_items(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<ItemEntry>> {
        let datasets = self.datasets.read();
        let dataset = match datasets.get(dataset_id) {
            Some(d) => d,
            None => return Err(StorageError::row_not_found(row)),
        };
        if !dataset.has_row(row) {
            return Err(StorageError::row_not_found(row));
        }
        Ok(dataset
            .items
            .get(row)
            .map(|items| items.iter().map(|i| i.entry.clone()).collect())
            .unwrap_or_default())
    }

    fn read_item(&self, dataset_id: &str, entry: &ItemEntry) -> Result<ItemValue> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let datasets = self.datasets.read();
        datasets
            .get(dataset_id)
            .and_then(|d| {
                d.items
                    .values()
                    .flatten()
                    .find(|i| i.entry.uri == entry.uri)
            })
            .map(|i| i.value.clone())
            .ok_or_else(|| StorageError::item_not_found(&entry.uri))
    }

    fn write_item(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        path: &str,
        format: &str,
        value: &ItemValue,
    ) -> Result<ItemEntry> {
        self.add_item(dataset_id, row, path, format, value.clone())
    }

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
    ) -> Result<Option<ProvenanceRecord>> {
        let datasets = self.datasets.read();
        Ok(datasets
            .get(dataset_id)
            .and_then(|d| d.provenance.get(&(row.clone(), column.to_string())))
            .cloned())
    }

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
        record: &ProvenanceRecord,
    ) -> Result<()> {
        let mut datasets = self.datasets.write();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        dataset
            .provenance
            .insert((row.clone(), column.to_string()), record.clone());
        Ok(())
    }

    fn remove_provenance(&self, dataset_id: &str, row: &RowLocator, column: &str) -> Result<()> {
        let mut datasets = self.datasets.write();
        if let Some(dataset) = datasets.get_mut(dataset_id) {
            dataset
                .provenance
                .remove(&(row.clone(), column.to_string()));
        }
        Ok(())
    }

    fn save_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
        definition: &serde_json::Value,
    ) -> Result<()> {
        self.definitions.write().insert(
            (dataset_id.to_string(), name.map(str::to_string)),
            definition.clone(),
        );
        Ok(())
    }

    fn load_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .definitions
            .read()
            .get(&(dataset_id.to_string(), name.map(str::to_string)))
            .cloned())
    }
}

fn item_uri(dataset_id: &str, row: &RowLocator, path: &str) -> String {
    format!("mem://{}/{}/{}", dataset_id, row.namespace(), path)
}
