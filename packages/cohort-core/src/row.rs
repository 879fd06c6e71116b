//! Rows: addressable points of a dataset at one frequency

use cohort_storage::{ItemEntry, RowLocator};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::space::Frequency;

/// Value identity of a row
///
/// `ids` holds one entry per axis of `frequency`, most significant axis
/// first. An axis may have no id (e.g. `group` in a study without groups).
/// Two keys with equal frequency and ids are the same logical row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub frequency: Frequency,
    pub ids: Vec<Option<String>>,
}

impl RowKey {
    pub fn new(frequency: Frequency, ids: Vec<Option<String>>) -> Self {
        Self { frequency, ids }
    }

    pub fn root() -> Self {
        Self {
            frequency: Frequency::ROOT,
            ids: Vec::new(),
        }
    }

    /// Ids of the axes that have one
    pub fn id_tuple(&self) -> Vec<&str> {
        self.ids.iter().flatten().map(String::as_str).collect()
    }

    /// Ids joined with `.`
    pub fn id_string(&self) -> String {
        self.id_tuple().join(".")
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.frequency, self.id_string())
    }
}

/// One row of a dataset
///
/// Item descriptors are listed from the store on first access and kept for
/// the lifetime of the row; resolved column items are memoised alongside.
#[derive(Debug)]
pub struct DataRow {
    key: RowKey,
    frequency_name: String,
    /// Ids of every axis of the space, by bit position
    axis_ids: Vec<Option<String>>,
    locator: RowLocator,
    label: Option<String>,
    items: OnceCell<Vec<ItemEntry>>,
    resolved: RwLock<HashMap<String, ItemEntry>>,
}

impl DataRow {
    pub(crate) fn new(
        key: RowKey,
        frequency_name: impl Into<String>,
        axis_ids: Vec<Option<String>>,
        locator: RowLocator,
        label: Option<String>,
    ) -> Self {
        Self {
            key,
            frequency_name: frequency_name.into(),
            axis_ids,
            locator,
            label,
            items: OnceCell::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn frequency(&self) -> Frequency {
        self.key.frequency
    }

    pub fn frequency_name(&self) -> &str {
        &self.frequency_name
    }

    pub fn ids(&self) -> &[Option<String>] {
        &self.key.ids
    }

    /// Id of the axis at bit `index`, if the row's frequency includes it
    pub fn axis_id(&self, index: usize) -> Option<&str> {
        if self.key.frequency.bits() & (1 << index) == 0 {
            return None;
        }
        self.axis_ids.get(index).and_then(|id| id.as_deref())
    }

    pub(crate) fn axis_ids(&self) -> &[Option<String>] {
        &self.axis_ids
    }

    pub fn locator(&self) -> &RowLocator {
        &self.locator
    }

    /// Tree label for rows of the physical hierarchy, joined ids otherwise
    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.key.id_string())
    }

    pub fn id_string(&self) -> String {
        self.key.id_string()
    }

    /// Ids of this row restricted to the axes of `target`
    pub fn project(&self, target: Frequency) -> Vec<Option<String>> {
        project(&self.axis_ids, target)
    }

    /// Item descriptors at this row, listed once with `list`
    pub fn items_with<F>(&self, list: F) -> Result<&[ItemEntry]>
    where
        F: FnOnce() -> Result<Vec<ItemEntry>>,
    {
        self.items.get_or_try_init(list).map(Vec::as_slice)
    }

    pub fn cached_resolution(&self, column: &str) -> Option<ItemEntry> {
        self.resolved.read().get(column).cloned()
    }

    pub(crate) fn cache_resolution(&self, column: &str, entry: ItemEntry) {
        self.resolved.write().insert(column.to_string(), entry);
    }
}

impl fmt::Display for DataRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.frequency_name, self.key.id_string())
    }
}

pub(crate) fn project(axis_ids: &[Option<String>], target: Frequency) -> Vec<Option<String>> {
    target
        .axis_indices()
        .into_iter()
        .map(|i| axis_ids.get(i).cloned().flatten())
        .collect()
}
