//! Column resolution engine
//!
//! Selects the single item of a row that a column refers to. Source columns
//! narrow the row's items step by step (path, quality, header, format) and
//! then rank what remains; every step that empties the candidate list is
//! named in the resulting `NoMatchingItem` error.

use cohort_storage::{ItemEntry, StoreCapabilities};
use regex::Regex;
use std::cmp::Ordering;

use crate::column::{ColumnSpec, SourceCriteria};
use crate::config::OrderTieBreak;
use crate::error::{DataError, Result};
use crate::format::{ConversionPath, FormatRegistry};
use crate::row::{DataRow, RowKey};

/// Item selected for one column at one row
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub column: String,
    pub row: RowKey,
    pub entry: ItemEntry,
    /// Converters from the stored format to the column format
    pub conversion: ConversionPath,
}

impl ResolvedItem {
    pub fn needs_conversion(&self) -> bool {
        !self.conversion.is_identity()
    }

    pub fn digest(&self) -> String {
        self.entry.digest()
    }
}

/// Value of a column as seen from a row of a possibly different frequency
#[derive(Debug, Clone)]
pub enum ResolvedInput {
    /// Same or coarser frequency, broadcast to the consuming row
    Single(ResolvedItem),
    /// Finer frequency, one item per related row ordered by ids
    Sequence(Vec<ResolvedItem>),
}

impl ResolvedInput {
    pub fn items(&self) -> Vec<&ResolvedItem> {
        match self {
            ResolvedInput::Single(item) => vec![item],
            ResolvedInput::Sequence(items) => items.iter().collect(),
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, ResolvedInput::Sequence(_))
    }

    /// Digests in consumption order
    pub fn digests(&self) -> Vec<String> {
        self.items().iter().map(|item| item.digest()).collect()
    }
}

/// Stateless matcher of column specs against the items of a row
#[derive(Debug, Clone, Copy)]
pub struct ColumnResolver<'a> {
    formats: &'a FormatRegistry,
    capabilities: StoreCapabilities,
    tie_break: OrderTieBreak,
    full_match: bool,
    store: &'a str,
}

impl<'a> ColumnResolver<'a> {
    pub fn new(formats: &'a FormatRegistry, capabilities: StoreCapabilities, store: &'a str) -> Self {
        Self {
            formats,
            capabilities,
            tie_break: OrderTieBreak::default(),
            full_match: true,
            store,
        }
    }

    pub fn with_tie_break(mut self, tie_break: OrderTieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_full_match(mut self, full_match: bool) -> Self {
        self.full_match = full_match;
        self
    }

    /// Pick the item of `row` that `spec` refers to
    pub fn resolve(&self, row: &DataRow, items: &[ItemEntry], spec: &ColumnSpec) -> Result<ResolvedItem> {
        if row.frequency() != spec.frequency {
            return Err(DataError::WrongFrequency {
                column: spec.name.clone(),
                expected: spec.frequency.to_string(),
                found: row.frequency_name().to_string(),
            });
        }
        let entry = match spec.source_criteria() {
            Some(criteria) => self.select_source(row, items, spec, criteria)?,
            None => self.select_sink(row, items, spec)?,
        };
        let conversion = self.formats.conversion_path(&entry.format, &spec.format)?;
        Ok(ResolvedItem {
            column: spec.name.clone(),
            row: row.key().clone(),
            entry,
            conversion,
        })
    }

    fn select_sink(&self, row: &DataRow, items: &[ItemEntry], spec: &ColumnSpec) -> Result<ItemEntry> {
        let path = spec.sink_path().unwrap_or(spec.name.as_str());
        let entry = items
            .iter()
            .find(|entry| entry.path == path)
            .ok_or_else(|| DataError::no_match(&spec.name, row, format!("'{path}' has not been derived")))?;
        if !self.format_compatible(entry, &spec.format) {
            return Err(DataError::no_match(
                &spec.name,
                row,
                format!(
                    "'{path}' is stored as '{}', which cannot be converted to '{}'",
                    entry.format, spec.format
                ),
            ));
        }
        Ok(entry.clone())
    }

    fn select_source(
        &self,
        row: &DataRow,
        items: &[ItemEntry],
        spec: &ColumnSpec,
        criteria: &SourceCriteria,
    ) -> Result<ItemEntry> {
        let empty = |reason: String| DataError::no_match(&spec.name, row, reason);

        // 1. path
        let mut candidates: Vec<&ItemEntry> = if criteria.is_regex {
            let pattern = self.compile(&criteria.path)?;
            items.iter().filter(|e| pattern.is_match(&e.path)).collect()
        } else {
            items.iter().filter(|e| e.path == criteria.path).collect()
        };
        if candidates.is_empty() {
            return Err(empty(format!(
                "no item path matches {} '{}'",
                if criteria.is_regex { "pattern" } else { "path" },
                criteria.path
            )));
        }

        // 2. quality, a no-op for stores that do not track it
        if let Some(threshold) = criteria.quality_threshold {
            if self.capabilities.quality {
                candidates.retain(|e| e.effective_quality() >= threshold);
                if candidates.is_empty() {
                    return Err(empty(format!("no candidate has quality >= {threshold}")));
                }
            }
        }

        // 3. header
        if !criteria.header.is_empty() {
            if !self.capabilities.headers {
                return Err(DataError::UnsupportedCriterion {
                    criterion: "header".to_string(),
                    reason: format!("store '{}' does not introspect item headers", self.store),
                });
            }
            if !self.formats.supports_headers(&spec.format) {
                return Err(DataError::UnsupportedCriterion {
                    criterion: "header".to_string(),
                    reason: format!("format '{}' has no introspectable header", spec.format),
                });
            }
            candidates.retain(|e| {
                criteria
                    .header
                    .iter()
                    .all(|(key, value)| e.header.get(key) == Some(value))
            });
            if candidates.is_empty() {
                return Err(empty("no candidate matches the header criteria".to_string()));
            }
        }

        // 4. format
        candidates.retain(|e| self.format_compatible(e, &spec.format));
        if candidates.is_empty() {
            return Err(empty(format!(
                "no candidate is stored as, or convertible to, '{}'",
                spec.format
            )));
        }

        // 5. rank and pick
        candidates.sort_by(|a, b| self.rank(a, b));
        match criteria.order {
            Some(order) => {
                let index = (order as usize).checked_sub(1).ok_or_else(|| {
                    DataError::InvalidCriterion(format!("order of column '{}' is 1-based", spec.name))
                })?;
                candidates.get(index).map(|e| (*e).clone()).ok_or_else(|| {
                    empty(format!(
                        "order {order} is out of range ({} candidates)",
                        candidates.len()
                    ))
                })
            }
            None if candidates.len() > 1 => Err(DataError::AmbiguousMatch {
                column: spec.name.clone(),
                row: row.to_string(),
                candidates: candidates.iter().map(|e| e.path.clone()).collect(),
            }),
            None => Ok(candidates[0].clone()),
        }
    }

    fn compile(&self, pattern: &str) -> Result<Regex> {
        if self.full_match {
            Ok(Regex::new(&format!("^(?:{pattern})$"))?)
        } else {
            Ok(Regex::new(pattern)?)
        }
    }

    fn format_compatible(&self, entry: &ItemEntry, format: &str) -> bool {
        entry.format == format || self.formats.can_convert(&entry.format, format)
    }

    fn rank(&self, a: &ItemEntry, b: &ItemEntry) -> Ordering {
        match self.tie_break {
            OrderTieBreak::Acquisition => match (a.order, b.order) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.path.cmp(&b.path)),
            OrderTieBreak::Path => a.path.cmp(&b.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnKind, SinkDefinition};
    use crate::space::Frequency;
    use cohort_storage::{ItemKind, Quality, RowLocator};

    fn row() -> DataRow {
        let freq = Frequency::from_bits(0b1);
        DataRow::new(
            RowKey::new(freq, vec![Some("s1".into())]),
            "sample",
            vec![Some("s1".into())],
            RowLocator::tree(vec!["s1".into()]),
            Some("s1".into()),
        )
    }

    fn item(path: &str, order: u32) -> ItemEntry {
        let mut entry = ItemEntry::new(path, format!("mem://{path}"), ItemKind::FileSet, "text");
        entry.order = Some(order);
        entry
    }

    fn source(criteria: SourceCriteria) -> ColumnSpec {
        ColumnSpec {
            name: "t1w".into(),
            frequency: Frequency::from_bits(0b1),
            format: "text".into(),
            kind: ColumnKind::Source(criteria),
        }
    }

    fn mprage_items() -> Vec<ItemEntry> {
        vec![
            item("t1_mprage", 1),
            item("t1_mprage_repeat", 2),
            item("t2_flair", 3),
        ]
    }

    #[test]
    fn test_exact_path() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let resolved = resolver
            .resolve(&row(), &mprage_items(), &source(SourceCriteria::path("t2_flair")))
            .unwrap();
        assert_eq!(resolved.entry.path, "t2_flair");
        assert!(!resolved.needs_conversion());
    }

    #[test]
    fn test_regex_ambiguity_then_order() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let items = mprage_items();

        let err = resolver
            .resolve(&row(), &items, &source(SourceCriteria::regex(".*mprage.*")))
            .unwrap_err();
        match err {
            DataError::AmbiguousMatch { candidates, .. } => {
                assert_eq!(candidates, vec!["t1_mprage", "t1_mprage_repeat"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let first = resolver
            .resolve(&row(), &items, &source(SourceCriteria::regex(".*mprage.*").with_order(1)))
            .unwrap();
        assert_eq!(first.entry.path, "t1_mprage");

        let out_of_range = resolver
            .resolve(&row(), &items, &source(SourceCriteria::regex(".*mprage.*").with_order(3)))
            .unwrap_err();
        assert!(matches!(out_of_range, DataError::NoMatchingItem { .. }));
    }

    #[test]
    fn test_regex_is_full_match() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let err = resolver
            .resolve(&row(), &mprage_items(), &source(SourceCriteria::regex("mprage")))
            .unwrap_err();
        assert!(matches!(err, DataError::NoMatchingItem { ref reason, .. } if reason.contains("pattern")));

        let partial = resolver.with_full_match(false);
        assert!(matches!(
            partial.resolve(&row(), &mprage_items(), &source(SourceCriteria::regex("mprage"))),
            Err(DataError::AmbiguousMatch { .. })
        ));
    }

    #[test]
    fn test_quality_filter_respects_capability() {
        let formats = FormatRegistry::standard();
        let mut items = mprage_items();
        items[0].quality = Some(Quality::Unusable);
        let criteria = SourceCriteria::regex(".*mprage.*").with_quality(Quality::Questionable);

        let with_quality = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let resolved = with_quality.resolve(&row(), &items, &source(criteria.clone())).unwrap();
        assert_eq!(resolved.entry.path, "t1_mprage_repeat");

        let without = ColumnResolver::new(&formats, StoreCapabilities::none(), "plain");
        assert!(matches!(
            without.resolve(&row(), &items, &source(criteria)),
            Err(DataError::AmbiguousMatch { .. })
        ));
    }

    #[test]
    fn test_header_criteria() {
        let formats = FormatRegistry::standard();
        let criteria = SourceCriteria::regex(".*mprage.*").with_header("ImageType", "ORIGINAL");

        let plain = ColumnResolver::new(&formats, StoreCapabilities::none(), "plain");
        assert!(matches!(
            plain.resolve(&row(), &mprage_items(), &source(criteria.clone())),
            Err(DataError::UnsupportedCriterion { .. })
        ));

        // text has no header even when the store could introspect one
        let capable = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        assert!(matches!(
            capable.resolve(&row(), &mprage_items(), &source(criteria.clone())),
            Err(DataError::UnsupportedCriterion { .. })
        ));

        let mut items = mprage_items();
        for entry in &mut items {
            entry.format = "dicom".into();
        }
        items[1]
            .header
            .insert("ImageType".into(), serde_json::json!("ORIGINAL"));
        let dicom = ColumnSpec {
            format: "dicom".into(),
            ..source(criteria)
        };
        let resolved = capable.resolve(&row(), &items, &dicom).unwrap();
        assert_eq!(resolved.entry.path, "t1_mprage_repeat");
    }

    #[test]
    fn test_incompatible_format_filtered() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let mut items = mprage_items();
        items[1].format = "dicom".into();
        let resolved = resolver
            .resolve(&row(), &items, &source(SourceCriteria::regex(".*mprage.*")))
            .unwrap();
        assert_eq!(resolved.entry.path, "t1_mprage");
    }

    #[test]
    fn test_path_tie_break() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory")
            .with_tie_break(OrderTieBreak::Path);
        let items = vec![item("b_scan", 1), item("a_scan", 2)];
        let resolved = resolver
            .resolve(&row(), &items, &source(SourceCriteria::regex(".*_scan").with_order(1)))
            .unwrap();
        assert_eq!(resolved.entry.path, "a_scan");
    }

    #[test]
    fn test_sink_matches_exact_path() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let sink = ColumnSpec {
            name: "t1_mprage".into(),
            frequency: Frequency::from_bits(0b1),
            format: "text".into(),
            kind: ColumnKind::Sink(SinkDefinition::default()),
        };
        assert_eq!(
            resolver.resolve(&row(), &mprage_items(), &sink).unwrap().entry.path,
            "t1_mprage"
        );

        let missing = ColumnSpec {
            name: "brain_mask".into(),
            ..sink
        };
        assert!(matches!(
            resolver.resolve(&row(), &mprage_items(), &missing),
            Err(DataError::NoMatchingItem { .. })
        ));
    }

    #[test]
    fn test_wrong_frequency_rejected() {
        let formats = FormatRegistry::standard();
        let resolver = ColumnResolver::new(&formats, StoreCapabilities::default(), "memory");
        let spec = ColumnSpec {
            frequency: Frequency::ROOT,
            ..source(SourceCriteria::path("t2_flair"))
        };
        assert!(matches!(
            resolver.resolve(&row(), &mprage_items(), &spec),
            Err(DataError::WrongFrequency { .. })
        ));
    }
}
