//! Datasets: a hierarchy over a store plus named columns
//!
//! # Examples
//!
//! ```rust,ignore
//! use cohort_core::{Dataset, DataSpace, SourceCriteria, SinkDefinition};
//!
//! let mut dataset = Dataset::builder("study1", store, DataSpace::clinical())
//!     .hierarchy(["subject", "session"])
//!     .id_inference(IdInference::new("subject", r"(?P<group>[a-z]+)(?P<member>\d+)"))
//!     .exclude(RowFilter::ids("subject", ["patient09"]))
//!     .build()?;
//!
//! dataset.add_source("t1w", SourceCriteria::regex(".*mprage.*").with_order(1), "session", "dicom")?;
//! dataset.add_sink("brain_mask", SinkDefinition::default(), "session", "nifti_gz")?;
//!
//! for row in dataset.rows("session")? {
//!     let item = dataset.resolve(&row, "t1w")?;
//!     println!("{} -> {}", row, item.entry.uri);
//! }
//! dataset.save(None)?;
//! ```

use cohort_storage::{DataStore, ItemEntry, ItemValue, ProvenanceRecord};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::column::{ColumnKind, ColumnSpec, SinkDefinition, SourceCriteria};
use crate::config::CohortConfig;
use crate::definition::{
    ColumnDefinition, DatasetDefinition, DatasetLocator, SpaceDefinition, DEFINITION_VERSION,
};
use crate::error::{DataError, Result};
use crate::filter::{CompiledFilter, FilterKind, RowFilter};
use crate::format::FormatRegistry;
use crate::inference::{CompiledInference, IdInference};
use crate::resolve::{ColumnResolver, ResolvedInput, ResolvedItem};
use crate::row::DataRow;
use crate::space::{DataSpace, Frequency};
use crate::tree::DataTree;

/// Builder for [`Dataset`]
pub struct DatasetBuilder {
    id: String,
    name: Option<String>,
    store: Arc<dyn DataStore>,
    space: DataSpace,
    hierarchy: Vec<String>,
    id_inference: Vec<IdInference>,
    include: Vec<RowFilter>,
    exclude: Vec<RowFilter>,
    config: CohortConfig,
    formats: Option<FormatRegistry>,
}

impl DatasetBuilder {
    /// Frequency names of the physical layers, root to leaf
    pub fn hierarchy<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hierarchy = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn id_inference(mut self, rule: IdInference) -> Self {
        self.id_inference.push(rule);
        self
    }

    pub fn include(mut self, filter: RowFilter) -> Self {
        self.include.push(filter);
        self
    }

    pub fn exclude(mut self, filter: RowFilter) -> Self {
        self.exclude.push(filter);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: CohortConfig) -> Self {
        self.config = config;
        self
    }

    pub fn formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn build(self) -> Result<Dataset> {
        let hierarchy = validate_hierarchy(&self.space, &self.hierarchy)?;

        let mut inference = Vec::with_capacity(self.id_inference.len());
        for rule in &self.id_inference {
            let compiled = rule.compile()?;
            if let Some(group) = compiled
                .groups()
                .iter()
                .find(|g| !self.space.axis_names().contains(*g))
            {
                return Err(DataError::InvalidCriterion(format!(
                    "id inference group '{}' is not an axis of '{}'",
                    group, self.space
                )));
            }
            inference.push(compiled);
        }

        let mut filters = Vec::with_capacity(self.include.len() + self.exclude.len());
        for filter in &self.include {
            filters.push(CompiledFilter::compile(filter, FilterKind::Include, &self.space, &hierarchy)?);
        }
        for filter in &self.exclude {
            filters.push(CompiledFilter::compile(filter, FilterKind::Exclude, &self.space, &hierarchy)?);
        }

        Ok(Dataset {
            id: self.id,
            name: self.name,
            store: self.store,
            space: self.space,
            hierarchy,
            id_inference: self.id_inference,
            inference,
            include: self.include,
            exclude: self.exclude,
            filters,
            columns: BTreeMap::new(),
            formats: Arc::new(self.formats.unwrap_or_else(FormatRegistry::standard)),
            config: self.config,
            tree: RwLock::new(None),
        })
    }
}

/// Layers must be known, each must add an axis, and together they must
/// reach the leaf frequency
fn validate_hierarchy(space: &DataSpace, layers: &[String]) -> Result<Vec<Frequency>> {
    if layers.is_empty() {
        return Err(DataError::invalid_hierarchy(layers, "no layers declared"));
    }
    let mut hierarchy = Vec::with_capacity(layers.len());
    let mut covered = Frequency::ROOT;
    for name in layers {
        let layer = space.parse(name)?;
        if (layer ^ (layer & covered)).is_root() {
            return Err(DataError::invalid_hierarchy(
                layers,
                format!("layer '{name}' adds no axis to the layers above it"),
            ));
        }
        covered = covered | layer;
        hierarchy.push(layer);
    }
    if covered != space.leaf() {
        return Err(DataError::invalid_hierarchy(
            layers,
            format!("layers do not cover the '{}' frequency", space.name_of(space.leaf())?),
        ));
    }
    Ok(hierarchy)
}

/// Hierarchy, filters and columns over one dataset of a store
///
/// Columns are mutated through `&mut self`; the row index is shared behind a
/// reader-writer lock and built on first use.
pub struct Dataset {
    id: String,
    name: Option<String>,
    store: Arc<dyn DataStore>,
    space: DataSpace,
    hierarchy: Vec<Frequency>,
    id_inference: Vec<IdInference>,
    inference: Vec<CompiledInference>,
    include: Vec<RowFilter>,
    exclude: Vec<RowFilter>,
    filters: Vec<CompiledFilter>,
    columns: BTreeMap<String, ColumnSpec>,
    formats: Arc<FormatRegistry>,
    config: CohortConfig,
    tree: RwLock<Option<Arc<DataTree>>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("locator", &self.locator().to_string())
            .field("space", &self.space.name())
            .field("columns", &self.columns.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dataset {
    pub fn builder(id: impl Into<String>, store: Arc<dyn DataStore>, space: DataSpace) -> DatasetBuilder {
        DatasetBuilder {
            id: id.into(),
            name: None,
            store,
            space,
            hierarchy: Vec::new(),
            id_inference: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            config: CohortConfig::default(),
            formats: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn space(&self) -> &DataSpace {
        &self.space
    }

    pub fn hierarchy(&self) -> &[Frequency] {
        &self.hierarchy
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Registry for adding formats and converters
    pub fn formats_mut(&mut self) -> &mut FormatRegistry {
        Arc::make_mut(&mut self.formats)
    }

    pub fn locator(&self) -> DatasetLocator {
        DatasetLocator::new(self.store.name(), self.id.clone(), self.name.clone())
    }

    pub fn parse_locator(locator: &str) -> Result<DatasetLocator> {
        locator.parse()
    }

    /// Parse a frequency name of this dataset's space
    pub fn frequency(&self, name: &str) -> Result<Frequency> {
        self.space.parse(name)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Columns
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        criteria: SourceCriteria,
        frequency: &str,
        format: impl Into<String>,
    ) -> Result<&ColumnSpec> {
        let spec = ColumnSpec {
            name: name.into(),
            frequency: self.space.parse(frequency)?,
            format: format.into(),
            kind: ColumnKind::Source(criteria),
        };
        self.add_column(spec, false)
    }

    pub fn add_sink(
        &mut self,
        name: impl Into<String>,
        sink: SinkDefinition,
        frequency: &str,
        format: impl Into<String>,
    ) -> Result<&ColumnSpec> {
        let spec = ColumnSpec {
            name: name.into(),
            frequency: self.space.parse(frequency)?,
            format: format.into(),
            kind: ColumnKind::Sink(sink),
        };
        self.add_column(spec, false)
    }

    /// Validate and register `spec`, replacing a same-named column only when
    /// `overwrite` is set
    pub fn add_column(&mut self, spec: ColumnSpec, overwrite: bool) -> Result<&ColumnSpec> {
        if !self.space.contains(spec.frequency) {
            return Err(DataError::UnknownFrequency {
                space: self.space.name().to_string(),
                name: spec.frequency.to_string(),
            });
        }
        if !self.formats.contains(&spec.format) {
            return Err(DataError::UnknownFormat(spec.format.clone()));
        }
        if let ColumnKind::Source(criteria) = &spec.kind {
            validate_criteria(&spec.name, criteria)?;
        }
        if self.columns.contains_key(&spec.name) {
            if !overwrite {
                return Err(DataError::DuplicateColumn(spec.name));
            }
            warn!(dataset = %self.id, column = %spec.name, "Overwriting existing column");
        }
        debug!(
            dataset = %self.id,
            column = %spec.name,
            sink = spec.is_sink(),
            "Added column"
        );
        let name = spec.name.clone();
        self.columns.insert(name.clone(), spec);
        Ok(&self.columns[&name])
    }

    pub fn remove_column(&mut self, name: &str) -> Result<ColumnSpec> {
        self.columns
            .remove(name)
            .ok_or_else(|| DataError::UnknownColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<&ColumnSpec> {
        self.columns
            .get(name)
            .ok_or_else(|| DataError::UnknownColumn(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Columns in name order
    pub fn columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.values()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rows
    // ═══════════════════════════════════════════════════════════════════════

    /// Row index, listed from the store on first use
    pub fn tree(&self) -> Result<Arc<DataTree>> {
        if let Some(tree) = self.tree.read().as_ref() {
            return Ok(Arc::clone(tree));
        }
        let mut slot = self.tree.write();
        if let Some(tree) = slot.as_ref() {
            return Ok(Arc::clone(tree));
        }
        let layers = self.layer_names()?;
        let leaves = self.store.list_rows(&self.id, &layers)?;
        let tree = Arc::new(DataTree::build(
            self.space.clone(),
            self.hierarchy.clone(),
            leaves,
            &self.inference,
            self.filters.clone(),
        )?);
        info!(
            dataset = %self.id,
            leaves = tree.leaf_count(),
            "Populated row index"
        );
        *slot = Some(Arc::clone(&tree));
        Ok(tree)
    }

    /// Drop the row index so the next access lists the store again
    pub fn refresh(&self) {
        if self.tree.write().take().is_some() {
            debug!(dataset = %self.id, "Dropped row index");
        }
    }

    /// Visible rows at `frequency`, ordered by ids
    pub fn rows(&self, frequency: &str) -> Result<Vec<Arc<DataRow>>> {
        self.tree()?.rows(self.space.parse(frequency)?)
    }

    pub fn rows_at(&self, frequency: Frequency) -> Result<Vec<Arc<DataRow>>> {
        self.tree()?.rows(frequency)
    }

    pub fn row(&self, frequency: &str, ids: &[&str]) -> Result<Arc<DataRow>> {
        self.tree()?.get_row(self.space.parse(frequency)?, ids)
    }

    /// Item descriptors stored at `row`
    pub fn items<'r>(&self, row: &'r DataRow) -> Result<&'r [ItemEntry]> {
        row.items_with(|| Ok(self.store.list_items(&self.id, row.locator())?))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════════════

    fn resolver(&self) -> ColumnResolver<'_> {
        ColumnResolver::new(&self.formats, self.store.capabilities(), self.store.name())
            .with_tie_break(self.config.order_tie_break)
            .with_full_match(self.config.regex_full_match)
    }

    /// Item of `column` at `row`
    pub fn resolve(&self, row: &DataRow, column: &str) -> Result<ResolvedItem> {
        let spec = self.column(column)?;
        if let Some(entry) = row.cached_resolution(column) {
            if row.frequency() == spec.frequency {
                let conversion = self.formats.conversion_path(&entry.format, &spec.format)?;
                return Ok(ResolvedItem {
                    column: spec.name.clone(),
                    row: row.key().clone(),
                    entry,
                    conversion,
                });
            }
        }
        let items = self.items(row)?;
        let resolved = self.resolver().resolve(row, items, spec)?;
        row.cache_resolution(column, resolved.entry.clone());
        Ok(resolved)
    }

    /// Value of `column` as consumed at `row`
    ///
    /// Columns at the same or a coarser frequency resolve to the single
    /// containing row's item; finer ones to the items of every related row,
    /// ordered by ids.
    pub fn resolve_input(&self, row: &DataRow, column: &str) -> Result<ResolvedInput> {
        let spec = self.column(column)?;
        let tree = self.tree()?;
        if row.frequency().is_superset(spec.frequency) {
            let source = tree.parent_row(row, spec.frequency)?;
            return Ok(ResolvedInput::Single(self.resolve(&source, column)?));
        }
        let related = tree.related_rows(row, spec.frequency)?;
        if related.is_empty() {
            return Err(DataError::no_match(
                column,
                row,
                format!("no {} rows are related", self.space.name_of(spec.frequency)?),
            ));
        }
        let items = related
            .iter()
            .map(|r| self.resolve(r, column))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResolvedInput::Sequence(items))
    }

    /// Pull an item through the store
    pub fn item_value(&self, entry: &ItemEntry) -> Result<ItemValue> {
        Ok(self.store.read_item(&self.id, entry)?)
    }

    /// Pull a resolved item, converting it to its column's format
    pub fn resolved_value(&self, item: &ResolvedItem, work_dir: &Path) -> Result<ItemValue> {
        let value = self.item_value(&item.entry)?;
        if !item.needs_conversion() {
            return Ok(value);
        }
        debug!(
            column = %item.column,
            row = %item.row,
            path = ?item.conversion.formats(),
            "Converting item to column format"
        );
        item.conversion.apply(value, work_dir)
    }

    /// Store `value` as the item of sink `column` at `row`
    pub fn write_sink(&self, row: &DataRow, column: &str, value: &ItemValue) -> Result<ItemEntry> {
        let spec = self.column(column)?;
        let path = spec.sink_path().ok_or_else(|| {
            DataError::InvalidCriterion(format!("column '{column}' is not a sink"))
        })?;
        if row.frequency() != spec.frequency {
            return Err(DataError::WrongFrequency {
                column: column.to_string(),
                expected: self.space.name_of(spec.frequency)?.to_string(),
                found: row.frequency_name().to_string(),
            });
        }
        Ok(self
            .store
            .write_item(&self.id, row.locator(), path, &spec.format, value)?)
    }

    pub fn read_provenance(&self, row: &DataRow, column: &str) -> Result<Option<ProvenanceRecord>> {
        Ok(self.store.read_provenance(&self.id, row.locator(), column)?)
    }

    pub fn write_provenance(&self, row: &DataRow, column: &str, record: &ProvenanceRecord) -> Result<()> {
        Ok(self.store.write_provenance(&self.id, row.locator(), column, record)?)
    }

    /// Forget how `column` at `row` was derived
    pub fn remove_provenance(&self, row: &DataRow, column: &str) -> Result<()> {
        Ok(self.store.remove_provenance(&self.id, row.locator(), column)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════

    pub fn definition(&self) -> Result<DatasetDefinition> {
        Ok(DatasetDefinition {
            version: DEFINITION_VERSION,
            id: self.id.clone(),
            name: self.name.clone(),
            space: SpaceDefinition::from_space(&self.space)?,
            hierarchy: self.layer_names()?,
            id_inference: self.id_inference.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            columns: self
                .columns
                .values()
                .map(|spec| ColumnDefinition::from_spec(spec, &self.space))
                .collect::<Result<_>>()?,
        })
    }

    /// Persist the definition under `name` (or the dataset's own name)
    ///
    /// A stored definition with the same id and name is updated in place
    /// unless its space or hierarchy differ.
    pub fn save(&self, name: Option<&str>) -> Result<()> {
        let name = name.map(str::to_string).or_else(|| self.name.clone());
        let mut definition = self.definition()?;
        definition.name = name.clone();

        if let Some(stored) = self.store.load_definition(&self.id, name.as_deref())? {
            let stored = DatasetDefinition::from_json(stored)?;
            if let Some(reason) = stored.conflict_with(&definition) {
                return Err(DataError::DatasetDefinitionConflict {
                    locator: DatasetLocator::new(self.store.name(), self.id.clone(), name).to_string(),
                    reason,
                });
            }
        }
        self.store
            .save_definition(&self.id, name.as_deref(), &definition.to_json()?)?;
        info!(
            dataset = %self.id,
            name = name.as_deref().unwrap_or(""),
            columns = definition.columns.len(),
            "Saved dataset definition"
        );
        Ok(())
    }

    pub fn load(store: Arc<dyn DataStore>, id: &str, name: Option<&str>) -> Result<Dataset> {
        Self::load_with_config(store, id, name, CohortConfig::default())
    }

    pub fn load_with_config(
        store: Arc<dyn DataStore>,
        id: &str,
        name: Option<&str>,
        config: CohortConfig,
    ) -> Result<Dataset> {
        let raw = store.load_definition(id, name)?.ok_or_else(|| {
            cohort_storage::StorageError::definition_not_found(
                DatasetLocator::new(store.name(), id, name.map(str::to_string)).to_string(),
            )
        })?;
        Self::from_definition(store, DatasetDefinition::from_json(raw)?, config)
    }

    /// Rebuild a dataset from a definition
    pub fn from_definition(
        store: Arc<dyn DataStore>,
        definition: DatasetDefinition,
        config: CohortConfig,
    ) -> Result<Dataset> {
        let space = definition.space.to_space()?;
        let mut builder = Dataset::builder(definition.id, store, space)
            .hierarchy(definition.hierarchy)
            .config(config);
        if let Some(name) = definition.name {
            builder = builder.name(name);
        }
        for rule in definition.id_inference {
            builder = builder.id_inference(rule);
        }
        for filter in definition.include {
            builder = builder.include(filter);
        }
        for filter in definition.exclude {
            builder = builder.exclude(filter);
        }
        let mut dataset = builder.build()?;
        for column in &definition.columns {
            let spec = column.to_spec(&dataset.space)?;
            dataset.add_column(spec, false)?;
        }
        Ok(dataset)
    }

    fn layer_names(&self) -> Result<Vec<String>> {
        self.hierarchy
            .iter()
            .map(|f| self.space.name_of(*f).map(str::to_string))
            .collect()
    }
}

fn validate_criteria(column: &str, criteria: &SourceCriteria) -> Result<()> {
    if criteria.order == Some(0) {
        return Err(DataError::InvalidCriterion(format!(
            "order of column '{column}' is 1-based"
        )));
    }
    if criteria.is_regex {
        regex::Regex::new(&criteria.path).map_err(|e| {
            DataError::InvalidCriterion(format!("path pattern of column '{column}': {e}"))
        })?;
    }
    Ok(())
}
