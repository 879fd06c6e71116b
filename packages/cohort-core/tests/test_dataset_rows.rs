//! Integration tests for row enumeration over a store
//!
//! Covers:
//! - rows at tree and synthesized frequencies
//! - include/exclude filters and how far they cascade
//! - re-listing the store after `refresh`

use cohort_core::{DataError, DataSpace, Dataset, IdInference, RowFilter};
use cohort_storage::{DataStore, LeafEntry, MemoryStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Two axes: `member` (bit 0) and `group` (bit 1)
fn cohort_space() -> DataSpace {
    DataSpace::builder("cohort")
        .axis("member")
        .axis("group")
        .frequency("subject", &["group", "member"])
        .build()
        .unwrap()
}

fn grouped_store(scratch: &Path) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(scratch));
    for (group, subject) in [("control", "03"), ("control", "09"), ("patient", "01"), ("patient", "02")] {
        store.add_leaf("study", LeafEntry::new([group, subject])).unwrap();
    }
    store
}

fn flat_store(scratch: &Path) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(scratch));
    for label in ["control03", "control09", "patient01", "patient02"] {
        store.add_leaf("study", LeafEntry::new([label])).unwrap();
    }
    store
}

#[test]
fn test_group_subject_hierarchy_rows() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", grouped_store(scratch.path()), cohort_space())
        .hierarchy(["group", "subject"])
        .build()
        .unwrap();

    let subjects = dataset.rows("subject").unwrap();
    assert_eq!(subjects.len(), 4);
    let groups = dataset.rows("group").unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].label(), "control");

    // members are numbered per group in listing order
    let ids: Vec<String> = subjects.iter().map(|r| r.id_string()).collect();
    assert_eq!(ids, vec!["control.1", "control.2", "patient.1", "patient.2"]);
    assert_eq!(subjects[1].label(), "09");
}

#[test]
fn test_groups_synthesized_from_inferred_ids() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", flat_store(scratch.path()), cohort_space())
        .hierarchy(["subject"])
        .id_inference(IdInference::new("subject", r"(?P<group>[a-z]+)(?P<member>\d+)"))
        .build()
        .unwrap();

    assert_eq!(dataset.rows("subject").unwrap().len(), 4);
    let groups = dataset.rows("group").unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.locator().is_side_branch()));

    let tree = dataset.tree().unwrap();
    let control = dataset.row("group", &["control"]).unwrap();
    let members = tree
        .child_rows(&control, dataset.frequency("subject").unwrap())
        .unwrap();
    let labels: Vec<String> = members.iter().map(|r| r.label()).collect();
    assert_eq!(labels, vec!["control03", "control09"]);
}

#[test]
fn test_exclude_subject_only_removes_that_subject() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", grouped_store(scratch.path()), cohort_space())
        .hierarchy(["group", "subject"])
        .exclude(RowFilter::ids("subject", ["09"]))
        .build()
        .unwrap();

    let subjects = dataset.rows("subject").unwrap();
    assert_eq!(subjects.len(), 3);
    assert!(subjects.iter().all(|r| r.label() != "09"));
    // no implicit cascade to the coarser group rows
    assert_eq!(dataset.rows("group").unwrap().len(), 2);
}

#[test]
fn test_exclude_group_cascades_to_subjects() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", grouped_store(scratch.path()), cohort_space())
        .hierarchy(["group", "subject"])
        .exclude(RowFilter::ids("group", ["control"]))
        .build()
        .unwrap();

    assert_eq!(dataset.rows("group").unwrap().len(), 1);
    let subjects = dataset.rows("subject").unwrap();
    assert_eq!(subjects.len(), 2);
    assert!(subjects.iter().all(|r| r.id_string().starts_with("patient")));
}

#[test]
fn test_include_pattern() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", flat_store(scratch.path()), cohort_space())
        .hierarchy(["subject"])
        .id_inference(IdInference::new("subject", r"(?P<group>[a-z]+)(?P<member>\d+)"))
        .include(RowFilter::pattern("subject", "patient.*"))
        .build()
        .unwrap();
    let labels: Vec<String> = dataset
        .rows("subject")
        .unwrap()
        .iter()
        .map(|r| r.label())
        .collect();
    assert_eq!(labels, vec!["patient01", "patient02"]);
}

#[test]
fn test_exclusion_must_target_a_layer() {
    let scratch = tempdir().unwrap();
    let result = Dataset::builder("study", flat_store(scratch.path()), cohort_space())
        .hierarchy(["subject"])
        .id_inference(IdInference::new("subject", r"(?P<group>[a-z]+)(?P<member>\d+)"))
        .exclude(RowFilter::ids("group", ["control"]))
        .build();
    assert!(matches!(result, Err(DataError::InvalidCriterion(_))));
}

#[test]
fn test_unknown_row_and_frequency() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", grouped_store(scratch.path()), cohort_space())
        .hierarchy(["group", "subject"])
        .build()
        .unwrap();
    assert!(matches!(
        dataset.row("group", &["placebo"]),
        Err(DataError::RowNotFound(_))
    ));
    assert!(matches!(
        dataset.rows("visit"),
        Err(DataError::UnknownFrequency { .. })
    ));
}

#[test]
fn test_refresh_relists_store() {
    let scratch = tempdir().unwrap();
    let store = grouped_store(scratch.path());
    let dataset = Dataset::builder("study", store.clone(), cohort_space())
        .hierarchy(["group", "subject"])
        .build()
        .unwrap();
    assert_eq!(dataset.rows("subject").unwrap().len(), 4);

    store.add_leaf("study", LeafEntry::new(["patient", "07"])).unwrap();
    assert_eq!(dataset.rows("subject").unwrap().len(), 4);

    dataset.refresh();
    assert_eq!(dataset.rows("subject").unwrap().len(), 5);
    assert_eq!(store.name(), "memory");
}

#[test]
fn test_root_row_spans_everything() {
    let scratch = tempdir().unwrap();
    let dataset = Dataset::builder("study", grouped_store(scratch.path()), cohort_space())
        .hierarchy(["group", "subject"])
        .build()
        .unwrap();
    let roots = dataset.rows("dataset").unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].locator().to_string(), "<root>");
}
