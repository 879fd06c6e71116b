//! Row index built from the leaves of a store
//!
//! Every leaf listed by the store is assigned an id for each axis of the
//! space, layer by layer:
//!
//! 1. the label of each hierarchy layer is the id of that layer
//! 2. id-inference rules decompose layer labels into axis ids
//! 3. a layer that adds only unresolved axes and sits on no previous axes
//!    gives its label to its least significant new axis
//! 4. otherwise the layer's remaining axis gets an auto-numbered id, unique
//!    among siblings sharing the same parent path
//!
//! Rows at any frequency are projections of the leaves onto the axes of that
//! frequency. Frequencies that are cumulative layers of the hierarchy are
//! indexed eagerly; all others are synthesized on first request.

use cohort_storage::{LeafEntry, RowLocator};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{DataError, Result};
use crate::filter::CompiledFilter;
use crate::inference::CompiledInference;
use crate::row::{project, DataRow, RowKey};
use crate::space::{DataSpace, Frequency};

#[derive(Debug)]
struct Leaf {
    path: Vec<String>,
    /// Ids by axis bit position
    axis_ids: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct FrequencyIndex {
    rows: BTreeMap<Vec<Option<String>>, Arc<DataRow>>,
    by_id: HashMap<Vec<String>, Vec<Option<String>>>,
}

/// Index of the rows of one dataset
#[derive(Debug)]
pub struct DataTree {
    space: DataSpace,
    hierarchy: Vec<Frequency>,
    /// Union of the hierarchy layers up to and including each depth
    cumulative: Vec<Frequency>,
    leaves: Vec<Leaf>,
    filters: Vec<CompiledFilter>,
    indices: RwLock<HashMap<Frequency, Arc<FrequencyIndex>>>,
}

impl DataTree {
    /// Assign axis ids to `leaves` and index the tree frequencies
    pub fn build(
        space: DataSpace,
        hierarchy: Vec<Frequency>,
        leaves: Vec<LeafEntry>,
        inference: &[CompiledInference],
        filters: Vec<CompiledFilter>,
    ) -> Result<Self> {
        let layer_names = hierarchy
            .iter()
            .map(|f| space.name_of(*f).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let cumulative: Vec<Frequency> = hierarchy
            .iter()
            .scan(Frequency::ROOT, |acc, layer| {
                *acc = *acc | *layer;
                Some(*acc)
            })
            .collect();

        let mut assigner = IdAssigner {
            space: &space,
            hierarchy: &hierarchy,
            layer_names: &layer_names,
            inference,
            auto_ids: HashMap::new(),
        };
        let mut seen_paths = HashSet::new();
        let mut seen_ids: HashMap<Vec<Option<String>>, Vec<String>> = HashMap::new();
        let mut indexed = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            if !seen_paths.insert(leaf.path.clone()) {
                return Err(DataError::TreeConstruction(format!(
                    "duplicate leaf {}",
                    leaf.path.join("/")
                )));
            }
            let axis_ids = assigner.assign(&leaf)?;
            if let Some(existing) = seen_ids.insert(axis_ids.clone(), leaf.path.clone()) {
                return Err(DataError::TreeConstruction(format!(
                    "ID clash between leaves {} and {}",
                    existing.join("/"),
                    leaf.path.join("/")
                )));
            }
            indexed.push(Leaf {
                path: leaf.path,
                axis_ids,
            });
        }

        let tree = Self {
            space,
            hierarchy,
            cumulative,
            leaves: indexed,
            filters,
            indices: RwLock::new(HashMap::new()),
        };
        let mut eager = vec![Frequency::ROOT];
        eager.extend(tree.cumulative.iter().copied());
        for freq in eager {
            tree.index(freq)?;
        }
        debug!(
            space = %tree.space,
            leaves = tree.leaves.len(),
            "Built data tree"
        );
        Ok(tree)
    }

    pub fn space(&self) -> &DataSpace {
        &self.space
    }

    pub fn hierarchy(&self) -> &[Frequency] {
        &self.hierarchy
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Whether rows at `freq` live in the primary tree
    pub fn is_tree_frequency(&self, freq: Frequency) -> bool {
        freq.is_root() || self.cumulative.contains(&freq)
    }

    /// All visible rows at `freq`, ordered by ids ascending
    pub fn rows(&self, freq: Frequency) -> Result<Vec<Arc<DataRow>>> {
        Ok(self.index(freq)?.rows.values().cloned().collect())
    }

    /// Row at `freq` whose present ids are `ids`
    pub fn get_row(&self, freq: Frequency, ids: &[&str]) -> Result<Arc<DataRow>> {
        let index = self.index(freq)?;
        let wanted: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        index
            .by_id
            .get(&wanted)
            .and_then(|key| index.rows.get(key))
            .cloned()
            .ok_or_else(|| self.not_found(freq, &wanted.join(".")))
    }

    pub fn get_row_by_key(&self, key: &RowKey) -> Result<Arc<DataRow>> {
        self.index(key.frequency)?
            .rows
            .get(&key.ids)
            .cloned()
            .ok_or_else(|| self.not_found(key.frequency, &key.id_string()))
    }

    /// Rows at the finer frequency `target` contained in `row`
    pub fn child_rows(&self, row: &DataRow, target: Frequency) -> Result<Vec<Arc<DataRow>>> {
        if !row.frequency().is_parent_of(target) {
            return Err(DataError::InvalidNavigation(format!(
                "{} is not a strictly finer frequency than {}",
                self.freq_name(target),
                row.frequency_name()
            )));
        }
        self.matching(target, row.frequency(), row.ids())
    }

    /// Row at the coarser frequency `target` containing `row`
    pub fn parent_row(&self, row: &DataRow, target: Frequency) -> Result<Arc<DataRow>> {
        if !row.frequency().is_superset(target) {
            return Err(DataError::InvalidNavigation(format!(
                "{} is not coarser than {}",
                self.freq_name(target),
                row.frequency_name()
            )));
        }
        self.get_row_by_key(&RowKey::new(target, row.project(target)))
    }

    /// Single row at `target` shared by all `rows`
    ///
    /// Fails with `InconsistentAggregation` when the rows disagree on any of
    /// the axes retained by `target`.
    pub fn common_parent(&self, rows: &[Arc<DataRow>], target: Frequency) -> Result<Arc<DataRow>> {
        let first = rows.first().ok_or_else(|| {
            DataError::InvalidNavigation("no rows to aggregate".to_string())
        })?;
        let mut projections: Vec<Vec<Option<String>>> = Vec::new();
        for row in rows {
            if !row.frequency().is_superset(target) {
                return Err(DataError::InvalidNavigation(format!(
                    "{} is not coarser than {}",
                    self.freq_name(target),
                    row
                )));
            }
            let projected = row.project(target);
            if !projections.contains(&projected) {
                projections.push(projected);
            }
        }
        if projections.len() > 1 {
            let ids: Vec<String> = projections
                .iter()
                .map(|p| RowKey::new(target, p.clone()).id_string())
                .collect();
            return Err(DataError::InconsistentAggregation {
                frequency: self.freq_name(target),
                ids: ids.join(" vs "),
            });
        }
        self.parent_row(first, target)
    }

    /// Rows at `freq` that agree with `row` on the axes both frequencies share
    ///
    /// Coarser or equal frequencies yield the single containing row; finer
    /// ones yield all contained rows ordered by ids.
    pub fn related_rows(&self, row: &DataRow, freq: Frequency) -> Result<Vec<Arc<DataRow>>> {
        if row.frequency().is_superset(freq) {
            return Ok(vec![self.parent_row(row, freq)?]);
        }
        let common = row.frequency() & freq;
        self.matching(freq, common, &row.project(common))
    }

    fn matching(
        &self,
        freq: Frequency,
        on: Frequency,
        ids: &[Option<String>],
    ) -> Result<Vec<Arc<DataRow>>> {
        Ok(self
            .index(freq)?
            .rows
            .values()
            .filter(|candidate| candidate.project(on) == ids)
            .cloned()
            .collect())
    }

    fn index(&self, freq: Frequency) -> Result<Arc<FrequencyIndex>> {
        if !self.space.contains(freq) {
            return Err(DataError::UnknownFrequency {
                space: self.space.name().to_string(),
                name: freq.to_string(),
            });
        }
        if let Some(index) = self.indices.read().get(&freq) {
            return Ok(Arc::clone(index));
        }
        let mut indices = self.indices.write();
        if let Some(index) = indices.get(&freq) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(self.build_index(freq)?);
        if !self.is_tree_frequency(freq) {
            debug!(
                frequency = %self.freq_name(freq),
                rows = index.rows.len(),
                "Synthesized rows"
            );
        }
        indices.insert(freq, Arc::clone(&index));
        Ok(index)
    }

    fn build_index(&self, freq: Frequency) -> Result<FrequencyIndex> {
        let freq_name = self.space.name_of(freq)?.to_string();
        let depth = self.cumulative.iter().position(|c| *c == freq);
        let filters: Vec<&CompiledFilter> =
            self.filters.iter().filter(|f| f.applies_to(freq)).collect();

        let mut index = FrequencyIndex::default();
        for leaf in &self.leaves {
            let admitted = filters
                .iter()
                .all(|f| f.admits(self.leaf_label(leaf, f.frequency()).as_deref()));
            if !admitted {
                continue;
            }
            let ids = project(&leaf.axis_ids, freq);
            if index.rows.contains_key(&ids) {
                continue;
            }
            let key = RowKey::new(freq, ids.clone());
            let (locator, label) = match depth {
                _ if freq.is_root() => (RowLocator::root(), None),
                Some(d) => (
                    RowLocator::tree(leaf.path[..=d].to_vec()),
                    Some(leaf.path[d].clone()),
                ),
                None => (
                    RowLocator::side_branch(
                        freq_name.clone(),
                        key.id_tuple().iter().map(|s| s.to_string()).collect(),
                    ),
                    None,
                ),
            };
            let id_tuple: Vec<String> = key.id_tuple().iter().map(|s| s.to_string()).collect();
            index.by_id.entry(id_tuple).or_insert_with(|| ids.clone());
            let row = DataRow::new(
                key,
                freq_name.clone(),
                leaf.axis_ids.clone(),
                locator,
                label,
            );
            index.rows.insert(ids, Arc::new(row));
        }
        Ok(index)
    }

    /// Label of `leaf` at `freq`: its layer label for hierarchy layers,
    /// otherwise its joined ids at that frequency
    fn leaf_label(&self, leaf: &Leaf, freq: Frequency) -> Option<String> {
        if let Some(layer) = self.hierarchy.iter().position(|h| *h == freq) {
            return leaf.path.get(layer).cloned();
        }
        let ids: Vec<String> = project(&leaf.axis_ids, freq).into_iter().flatten().collect();
        if ids.is_empty() {
            None
        } else {
            Some(ids.join("."))
        }
    }

    fn freq_name(&self, freq: Frequency) -> String {
        self.space
            .name_of(freq)
            .map(str::to_string)
            .unwrap_or_else(|_| freq.to_string())
    }

    fn not_found(&self, freq: Frequency, ids: &str) -> DataError {
        DataError::RowNotFound(format!("{}({})", self.freq_name(freq), ids))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Id assignment
// ═══════════════════════════════════════════════════════════════════════════

struct IdAssigner<'a> {
    space: &'a DataSpace,
    hierarchy: &'a [Frequency],
    layer_names: &'a [String],
    inference: &'a [CompiledInference],
    /// Parent path -> (layer label -> auto id)
    auto_ids: HashMap<Vec<Option<String>>, HashMap<String, String>>,
}

impl IdAssigner<'_> {
    fn assign(&mut self, leaf: &LeafEntry) -> Result<Vec<Option<String>>> {
        if leaf.path.len() != self.hierarchy.len() {
            return Err(DataError::TreeConstruction(format!(
                "leaf {} has {} labels but the hierarchy has {} layers",
                leaf.path.join("/"),
                leaf.path.len(),
                self.hierarchy.len()
            )));
        }

        let mut ids: HashMap<String, Option<String>> = self
            .layer_names
            .iter()
            .cloned()
            .zip(leaf.path.iter().cloned().map(Some))
            .collect();
        for rule in self.inference {
            let label = ids
                .get(rule.source())
                .cloned()
                .flatten()
                .or_else(|| leaf.metadata.get(rule.source()).cloned())
                .ok_or_else(|| {
                    DataError::TreeConstruction(format!(
                        "id inference source '{}' is neither a layer nor leaf metadata",
                        rule.source()
                    ))
                })?;
            for (axis, id) in rule.infer(&label)? {
                ids.insert(axis, Some(id));
            }
        }

        let mut cumulative = Frequency::ROOT;
        for (depth, layer) in self.hierarchy.iter().enumerate() {
            let previous = *layer & cumulative;
            let new = previous ^ *layer;
            if new.is_root() {
                return Err(DataError::TreeConstruction(format!(
                    "layer '{}' adds no new axes",
                    self.layer_names[depth]
                )));
            }
            let span = self.axis_names(*layer)?;
            let unresolved: Vec<String> = span
                .iter()
                .filter(|axis| !ids.contains_key(*axis))
                .cloned()
                .collect();
            if let Some((last, rest)) = unresolved.split_last() {
                for axis in rest {
                    ids.insert(axis.clone(), None);
                }
                let assumed = if previous.is_root() && unresolved.len() == span.len() {
                    ids.get(&self.layer_names[depth]).cloned().flatten()
                } else {
                    let mut parent: Vec<Option<String>> =
                        leaf.path[..depth].iter().cloned().map(Some).collect();
                    for axis in self.axis_names(new)? {
                        if let Some(id) = ids.get(&axis) {
                            parent.push(id.clone());
                        }
                    }
                    let siblings = self.auto_ids.entry(parent).or_default();
                    let next = (siblings.len() + 1).to_string();
                    Some(
                        siblings
                            .entry(leaf.path[depth].clone())
                            .or_insert(next)
                            .clone(),
                    )
                };
                ids.insert(last.clone(), assumed);
            }
            cumulative = cumulative | *layer;
        }

        Ok(self
            .space
            .axis_names()
            .iter()
            .map(|axis| ids.get(axis).cloned().flatten())
            .collect())
    }

    fn axis_names(&self, freq: Frequency) -> Result<Vec<String>> {
        freq.span()
            .into_iter()
            .map(|axis| self.space.name_of(axis).map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterKind, RowFilter};
    use crate::inference::IdInference;

    fn clinical_tree(paths: &[[&str; 2]], filters: Vec<CompiledFilter>) -> DataTree {
        let space = DataSpace::clinical();
        let hierarchy = vec![
            space.parse("subject").unwrap(),
            space.parse("session").unwrap(),
        ];
        let inference = vec![IdInference::new(
            "subject",
            r"(?P<group>[a-z]+)(?P<member>\d+)",
        )
        .compile()
        .unwrap()];
        let leaves = paths.iter().map(|p| LeafEntry::new(p.iter().copied())).collect();
        DataTree::build(space, hierarchy, leaves, &inference, filters).unwrap()
    }

    fn study() -> DataTree {
        clinical_tree(
            &[
                ["control01", "visit1"],
                ["control01", "visit2"],
                ["control02", "visit1"],
                ["patient01", "visit1"],
                ["patient01", "visit2"],
            ],
            Vec::new(),
        )
    }

    #[test]
    fn test_inferred_and_auto_ids() {
        let tree = study();
        let space = tree.space().clone();
        let subjects = tree.rows(space.parse("subject").unwrap()).unwrap();
        let ids: Vec<String> = subjects.iter().map(|r| r.id_string()).collect();
        assert_eq!(ids, vec!["control.01", "control.02", "patient.01"]);
        assert_eq!(subjects[0].label(), "control01");

        // timepoint is auto-numbered per visit label under each subject path
        let sessions = tree.rows(space.leaf()).unwrap();
        assert_eq!(sessions.len(), 5);
        let timepoints = tree.rows(space.parse("timepoint").unwrap()).unwrap();
        let tp: Vec<String> = timepoints.iter().map(|r| r.id_string()).collect();
        assert_eq!(tp, vec!["1", "2"]);
    }

    #[test]
    fn test_synthesized_rows_use_side_branch() {
        let tree = study();
        let space = tree.space().clone();
        let group = space.parse("group").unwrap();
        assert!(!tree.is_tree_frequency(group));

        let groups = tree.rows(group).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.locator().is_side_branch()));

        let subject = tree.get_row(space.parse("subject").unwrap(), &["control", "01"]).unwrap();
        assert_eq!(
            subject.locator(),
            &RowLocator::tree(vec!["control01".into()])
        );
    }

    #[test]
    fn test_child_and_parent_navigation() {
        let tree = study();
        let space = tree.space().clone();
        let group = tree.get_row(space.parse("group").unwrap(), &["control"]).unwrap();
        let subjects = tree.child_rows(&group, space.parse("subject").unwrap()).unwrap();
        assert_eq!(subjects.len(), 2);

        let session = tree.get_row(space.leaf(), &["2", "patient", "01"]).unwrap();
        let parent = tree.parent_row(&session, space.parse("subject").unwrap()).unwrap();
        assert_eq!(parent.id_string(), "patient.01");

        assert!(tree.child_rows(&session, space.parse("subject").unwrap()).is_err());
        assert!(tree.parent_row(&group, space.leaf()).is_err());
    }

    #[test]
    fn test_common_parent_requires_consistent_ids() {
        let tree = study();
        let space = tree.space().clone();
        let subject = space.parse("subject").unwrap();
        let control_sessions = tree
            .child_rows(&tree.get_row(subject, &["control", "01"]).unwrap(), space.leaf())
            .unwrap();
        let parent = tree.common_parent(&control_sessions, subject).unwrap();
        assert_eq!(parent.id_string(), "control.01");

        let all_sessions = tree.rows(space.leaf()).unwrap();
        let err = tree.common_parent(&all_sessions, subject).unwrap_err();
        assert!(matches!(err, DataError::InconsistentAggregation { .. }));

        // Every session shares the dataset row
        let root = tree.common_parent(&all_sessions, Frequency::ROOT).unwrap();
        assert_eq!(root.key(), &RowKey::root());
    }

    #[test]
    fn test_related_rows_for_incomparable_frequencies() {
        let tree = study();
        let space = tree.space().clone();
        let group = tree.get_row(space.parse("group").unwrap(), &["control"]).unwrap();
        // batch = timepoint + group
        let batches = tree.related_rows(&group, space.parse("batch").unwrap()).unwrap();
        let ids: Vec<String> = batches.iter().map(|r| r.id_string()).collect();
        assert_eq!(ids, vec!["1.control", "2.control"]);
    }

    #[test]
    fn test_exclusion_cascades_to_finer_rows_only() {
        let space = DataSpace::clinical();
        let hierarchy = vec![
            space.parse("subject").unwrap(),
            space.parse("session").unwrap(),
        ];
        let exclude = CompiledFilter::compile(
            &RowFilter::ids("subject", ["control02"]),
            FilterKind::Exclude,
            &space,
            &hierarchy,
        )
        .unwrap();
        let tree = clinical_tree(
            &[
                ["control01", "visit1"],
                ["control02", "visit1"],
            ],
            vec![exclude],
        );
        assert_eq!(tree.rows(space.parse("subject").unwrap()).unwrap().len(), 1);
        assert_eq!(tree.rows(space.leaf()).unwrap().len(), 1);
        // group and member rows are coarser or incomparable: untouched
        assert_eq!(tree.rows(space.parse("member").unwrap()).unwrap().len(), 2);
        assert_eq!(tree.rows(space.parse("group").unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_leaf_with_wrong_depth_rejected() {
        let space = DataSpace::clinical();
        let hierarchy = vec![space.parse("session").unwrap()];
        let err = DataTree::build(
            space,
            hierarchy,
            vec![LeafEntry::new(["a", "b"])],
            &[],
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DataError::TreeConstruction(_)));
    }

    #[test]
    fn test_duplicate_leaf_rejected() {
        let space = DataSpace::samples();
        let hierarchy = vec![space.leaf()];
        let err = DataTree::build(
            space,
            hierarchy,
            vec![LeafEntry::new(["s1"]), LeafEntry::new(["s1"])],
            &[],
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate leaf"));
    }

    #[test]
    fn test_inference_failure_surfaces() {
        let space = DataSpace::clinical();
        let hierarchy = vec![space.parse("subject").unwrap(), space.leaf()];
        let inference = vec![IdInference::new("subject", r"(?P<group>[a-z]+)(?P<member>\d+)")
            .compile()
            .unwrap()];
        let err = DataTree::build(
            space,
            hierarchy,
            vec![LeafEntry::new(["SUBJ-A", "visit1"])],
            &inference,
            Vec::new(),
        )
        .unwrap_err();
        match err {
            DataError::IdInference { label, .. } => assert_eq!(label, "SUBJ-A"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_single_layer_without_groups() {
        // With a [subject, session] hierarchy and no inference the subject
        // label becomes the member id and groups are absent
        let space = DataSpace::clinical();
        let hierarchy = vec![space.parse("subject").unwrap(), space.leaf()];
        let tree = DataTree::build(
            space.clone(),
            hierarchy,
            vec![
                LeafEntry::new(["s1", "baseline"]),
                LeafEntry::new(["s2", "baseline"]),
            ],
            &[],
            Vec::new(),
        )
        .unwrap();
        let subjects = tree.rows(space.parse("subject").unwrap()).unwrap();
        assert_eq!(subjects[0].ids(), &[None, Some("s1".to_string())]);
        let s2 = tree.get_row(space.parse("subject").unwrap(), &["s2"]).unwrap();
        assert_eq!(s2.label(), "s2");
        let groups = tree.rows(space.parse("group").unwrap()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids(), &[None]);
    }
}
