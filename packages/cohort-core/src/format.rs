//! Format registry and converter graph
//!
//! Formats are nodes of a directed graph whose edges are converters. When an
//! item is stored in a different format than a consumer asks for, the
//! registry finds the path with the fewest conversions, breaking ties on the
//! lowest summed edge priority.

use cohort_storage::{ItemKind, ItemValue};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{DataError, Result};

/// Converts an item value between two formats
pub trait Converter: Send + Sync {
    /// Convert `value`, writing any new files under `work_dir`
    fn convert(&self, value: &ItemValue, work_dir: &Path) -> Result<ItemValue>;
}

struct FnConverter<F>(F);

impl<F> Converter for FnConverter<F>
where
    F: Fn(&ItemValue, &Path) -> Result<ItemValue> + Send + Sync,
{
    fn convert(&self, value: &ItemValue, work_dir: &Path) -> Result<ItemValue> {
        (self.0)(value, work_dir)
    }
}

/// Wrap a closure as a [`Converter`]
pub fn converter_fn<F>(f: F) -> Arc<dyn Converter>
where
    F: Fn(&ItemValue, &Path) -> Result<ItemValue> + Send + Sync + 'static,
{
    Arc::new(FnConverter(f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub name: String,
    pub kind: ItemKind,
    /// Whether header values can be introspected
    pub supports_headers: bool,
}

impl FormatInfo {
    pub fn file_set(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::FileSet,
            supports_headers: false,
        }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Field,
            supports_headers: false,
        }
    }

    pub fn with_headers(mut self) -> Self {
        self.supports_headers = true;
        self
    }
}

#[derive(Clone)]
struct ConverterEdge {
    priority: i32,
    converter: Arc<dyn Converter>,
}

/// One converter hop of a [`ConversionPath`]
#[derive(Clone)]
pub struct ConversionStep {
    pub from: String,
    pub to: String,
    converter: Arc<dyn Converter>,
}

impl fmt::Debug for ConversionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Sequence of converters from one format to another (empty when equal)
#[derive(Debug, Clone, Default)]
pub struct ConversionPath {
    steps: Vec<ConversionStep>,
}

impl ConversionPath {
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Format names visited, source first
    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = self.steps.iter().map(|s| s.from.as_str()).collect();
        if let Some(last) = self.steps.last() {
            formats.push(last.to.as_str());
        }
        formats
    }

    /// Run every converter in turn
    pub fn apply(&self, value: ItemValue, work_dir: &Path) -> Result<ItemValue> {
        let mut current = value;
        for (i, step) in self.steps.iter().enumerate() {
            let dir = work_dir.join(format!("convert-{}-{}", i, step.to));
            std::fs::create_dir_all(&dir).map_err(cohort_storage::StorageError::from)?;
            current = step
                .converter
                .convert(&current, &dir)
                .map_err(|e| DataError::Conversion {
                    from: step.from.clone(),
                    to: step.to.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(current)
    }
}

/// Registry of known formats and the converters between them
#[derive(Clone, Default)]
pub struct FormatRegistry {
    graph: DiGraph<FormatInfo, ConverterEdge>,
    nodes: HashMap<String, NodeIndex>,
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.nodes.keys().collect::<Vec<_>>())
            .field("converters", &self.graph.edge_count())
            .finish()
    }
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the generic formats every store understands
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for info in [
            FormatInfo::file_set("text"),
            FormatInfo::file_set("json"),
            FormatInfo::file_set("directory"),
            FormatInfo::file_set("dicom").with_headers(),
            FormatInfo::file_set("nifti_gz").with_headers(),
            FormatInfo::field("field"),
        ] {
            registry.register_format(info);
        }
        registry
    }

    /// Add or replace a format
    pub fn register_format(&mut self, info: FormatInfo) {
        match self.nodes.get(&info.name) {
            Some(index) => self.graph[*index] = info,
            None => {
                let name = info.name.clone();
                let index = self.graph.add_node(info);
                self.nodes.insert(name, index);
            }
        }
    }

    /// Add a converter edge; lower priority wins among equally short paths
    pub fn register_converter(
        &mut self,
        from: &str,
        to: &str,
        priority: i32,
        converter: Arc<dyn Converter>,
    ) -> Result<()> {
        let a = self.node(from)?;
        let b = self.node(to)?;
        self.graph.add_edge(
            a,
            b,
            ConverterEdge {
                priority,
                converter,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FormatInfo> {
        self.nodes.get(name).map(|i| &self.graph[*i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn supports_headers(&self, name: &str) -> bool {
        self.get(name).map(|f| f.supports_headers).unwrap_or(false)
    }

    pub fn can_convert(&self, from: &str, to: &str) -> bool {
        self.conversion_path(from, to).is_ok()
    }

    /// Fewest-hop converter path from `from` to `to`
    pub fn conversion_path(&self, from: &str, to: &str) -> Result<ConversionPath> {
        if from == to {
            return Ok(ConversionPath::default());
        }
        let no_path = || DataError::NoConversionPath {
            from: from.to_string(),
            to: to.to_string(),
        };
        let start = self.node(from)?;
        let goal = self.nodes.get(to).copied().ok_or_else(no_path)?;

        // Dijkstra on (hops, summed priority)
        let mut best: HashMap<NodeIndex, (usize, i64)> = HashMap::new();
        let mut previous: HashMap<NodeIndex, petgraph::graph::EdgeIndex> = HashMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(start, (0, 0));
        heap.push(Reverse((0usize, 0i64, start)));

        while let Some(Reverse((hops, cost, node))) = heap.pop() {
            if node == goal {
                break;
            }
            if best.get(&node).is_some_and(|b| *b < (hops, cost)) {
                continue;
            }
            for edge in self.graph.edges(node) {
                let next = (hops + 1, cost + i64::from(edge.weight().priority));
                let target = edge.target();
                if best.get(&target).map_or(true, |b| next < *b) {
                    best.insert(target, next);
                    previous.insert(target, edge.id());
                    heap.push(Reverse((next.0, next.1, target)));
                }
            }
        }

        if !previous.contains_key(&goal) {
            return Err(no_path());
        }
        let mut steps = Vec::new();
        let mut cursor = goal;
        while cursor != start {
            let edge_id = previous[&cursor];
            let (source, target) = self
                .graph
                .edge_endpoints(edge_id)
                .ok_or_else(no_path)?;
            let edge = &self.graph[edge_id];
            steps.push(ConversionStep {
                from: self.graph[source].name.clone(),
                to: self.graph[target].name.clone(),
                converter: Arc::clone(&edge.converter),
            });
            cursor = source;
        }
        steps.reverse();
        debug!(from, to, hops = steps.len(), "Resolved conversion path");
        Ok(ConversionPath { steps })
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| DataError::UnknownFormat(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(label: &'static str) -> Arc<dyn Converter> {
        converter_fn(move |value, _| match value {
            ItemValue::Field(v) => Ok(ItemValue::Field(serde_json::json!(format!(
                "{}|{}",
                v.as_str().unwrap_or_default(),
                label
            )))),
            other => Ok(other.clone()),
        })
    }

    fn registry() -> FormatRegistry {
        let mut registry = FormatRegistry::standard();
        for name in ["a", "b", "c", "d"] {
            registry.register_format(FormatInfo::field(name));
        }
        registry
    }

    #[test]
    fn test_identity_path() {
        let registry = registry();
        let path = registry.conversion_path("a", "a").unwrap();
        assert!(path.is_identity());
    }

    #[test]
    fn test_fewest_hops_wins_over_priority() {
        let mut registry = registry();
        registry.register_converter("a", "d", 100, tag("direct")).unwrap();
        registry.register_converter("a", "b", 0, tag("ab")).unwrap();
        registry.register_converter("b", "d", 0, tag("bd")).unwrap();

        let path = registry.conversion_path("a", "d").unwrap();
        assert_eq!(path.formats(), vec!["a", "d"]);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut registry = registry();
        registry.register_converter("a", "b", 5, tag("ab")).unwrap();
        registry.register_converter("b", "d", 5, tag("bd")).unwrap();
        registry.register_converter("a", "c", 1, tag("ac")).unwrap();
        registry.register_converter("c", "d", 1, tag("cd")).unwrap();

        let path = registry.conversion_path("a", "d").unwrap();
        assert_eq!(path.formats(), vec!["a", "c", "d"]);

        let dir = tempfile::tempdir().unwrap();
        let out = path
            .apply(ItemValue::Field(serde_json::json!("x")), dir.path())
            .unwrap();
        assert_eq!(out, ItemValue::Field(serde_json::json!("x|ac|cd")));
    }

    #[test]
    fn test_missing_path() {
        let mut registry = registry();
        registry.register_converter("a", "b", 0, tag("ab")).unwrap();
        assert!(matches!(
            registry.conversion_path("b", "a"),
            Err(DataError::NoConversionPath { .. })
        ));
        assert!(matches!(
            registry.conversion_path("zzz", "a"),
            Err(DataError::UnknownFormat(_))
        ));
        assert!(!registry.can_convert("a", "c"));
    }

    #[test]
    fn test_converter_failure_is_reported() {
        let mut registry = registry();
        registry
            .register_converter(
                "a",
                "b",
                0,
                converter_fn(|_, _| Err(DataError::InvalidCriterion("corrupt".into()))),
            )
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = registry
            .conversion_path("a", "b")
            .unwrap()
            .apply(ItemValue::Field(serde_json::json!(1)), dir.path())
            .unwrap_err();
        assert!(matches!(err, DataError::Conversion { ref reason, .. } if reason.contains("corrupt")));
    }

    #[test]
    fn test_standard_header_support() {
        let registry = FormatRegistry::standard();
        assert!(registry.supports_headers("dicom"));
        assert!(!registry.supports_headers("text"));
        assert!(!registry.supports_headers("unknown"));
    }
}
