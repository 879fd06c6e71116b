//! Axis algebra
//!
//! A [`DataSpace`] defines the orthogonal classification axes of a class of
//! datasets (e.g. `group`, `member`, `timepoint`) and names every one of the
//! 2^N combinations of them. Each combination is a [`Frequency`]: a bitmask
//! whose set bits are the axes a row at that granularity is identified by.
//!
//! - mask `0` is the whole-dataset frequency (one row)
//! - the full mask is the leaf frequency (finest rows)
//! - `a` is at least as fine as `b` iff `(a & b) == b`
//!
//! Completeness is checked when the space is built: a space that leaves any
//! mask unnamed is rejected before it can be used.
//!
//! # Examples
//!
//! ```rust
//! use cohort_core::space::DataSpace;
//!
//! let space = DataSpace::clinical();
//! let subject = space.compose(&["group", "member"]).unwrap();
//! assert_eq!(space.name_of(subject).unwrap(), "subject");
//! assert!(space.is_superset(space.leaf(), subject));
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor};
use std::sync::Arc;

use crate::error::{DataError, Result};

/// Maximum number of axes a space may declare
pub const MAX_AXES: usize = 16;

/// Default name of the mask-0 frequency
pub const DATASET_FREQUENCY: &str = "dataset";

// ═══════════════════════════════════════════════════════════════════════════
// Frequency
// ═══════════════════════════════════════════════════════════════════════════

/// Bitmask over the axes of a [`DataSpace`]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Frequency(u32);

impl Frequency {
    /// Whole-dataset frequency
    pub const ROOT: Frequency = Frequency(0);

    pub const fn from_bits(bits: u32) -> Self {
        Frequency(bits)
    }

    /// Single-axis frequency for bit `index`
    pub const fn axis(index: u32) -> Self {
        Frequency(1 << index)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    /// `self` has every axis of `other`
    pub const fn is_superset(self, other: Frequency) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_subset(self, other: Frequency) -> bool {
        other.is_superset(self)
    }

    /// `self` is strictly coarser than `child`
    pub const fn is_parent_of(self, child: Frequency) -> bool {
        child.is_superset(self) && child.0 != self.0
    }

    pub const fn count_axes(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_basis(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Single-axis components, most significant bit first
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cohort_core::space::Frequency;
    ///
    /// let span = Frequency::from_bits(0b101).span();
    /// assert_eq!(span, vec![Frequency::from_bits(0b100), Frequency::from_bits(0b001)]);
    /// ```
    pub fn span(self) -> Vec<Frequency> {
        (0..u32::BITS)
            .rev()
            .map(Frequency::axis)
            .filter(|axis| self.is_superset(*axis))
            .collect()
    }

    /// Bit positions of the set axes, most significant first
    pub fn axis_indices(self) -> Vec<usize> {
        (0..u32::BITS as usize)
            .rev()
            .filter(|i| self.0 & (1 << i) != 0)
            .collect()
    }
}

impl BitOr for Frequency {
    type Output = Frequency;

    fn bitor(self, rhs: Frequency) -> Frequency {
        Frequency(self.0 | rhs.0)
    }
}

impl BitAnd for Frequency {
    type Output = Frequency;

    fn bitand(self, rhs: Frequency) -> Frequency {
        Frequency(self.0 & rhs.0)
    }
}

impl BitXor for Frequency {
    type Output = Frequency;

    fn bitxor(self, rhs: Frequency) -> Frequency {
        Frequency(self.0 ^ rhs.0)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DataSpace
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct SpaceInner {
    name: String,
    /// Axis names, indexed by bit position
    axes: Vec<String>,
    /// Frequency names, indexed by mask
    names: Vec<String>,
    lookup: HashMap<String, Frequency>,
}

/// Named, complete set of frequencies over a fixed list of axes
///
/// Cheap to clone; all clones share one definition.
#[derive(Debug, Clone)]
pub struct DataSpace {
    inner: Arc<SpaceInner>,
}

impl PartialEq for DataSpace {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.name == other.inner.name && self.inner.names == other.inner.names)
    }
}

impl Eq for DataSpace {}

static CLINICAL: Lazy<DataSpace> = Lazy::new(|| {
    DataSpace::builder("clinical")
        .axis("member")
        .axis("group")
        .axis("timepoint")
        .frequency("subject", &["group", "member"])
        .frequency("batch", &["timepoint", "group"])
        .frequency("matchedpoint", &["timepoint", "member"])
        .frequency("session", &["timepoint", "group", "member"])
        .build()
        .unwrap_or_else(|e| unreachable!("built-in clinical space is complete: {}", e))
});

static SAMPLES: Lazy<DataSpace> = Lazy::new(|| {
    DataSpace::builder("samples")
        .axis("sample")
        .build()
        .unwrap_or_else(|e| unreachable!("built-in samples space is complete: {}", e))
});

impl DataSpace {
    pub fn builder(name: impl Into<String>) -> DataSpaceBuilder {
        DataSpaceBuilder {
            name: name.into(),
            axes: Vec::new(),
            frequencies: Vec::new(),
        }
    }

    /// Imaging studies: `member`, `group` and `timepoint` axes
    ///
    /// | mask  | name         |
    /// |-------|--------------|
    /// | 0b000 | dataset      |
    /// | 0b001 | member       |
    /// | 0b010 | group        |
    /// | 0b011 | subject      |
    /// | 0b100 | timepoint    |
    /// | 0b101 | matchedpoint |
    /// | 0b110 | batch        |
    /// | 0b111 | session      |
    pub fn clinical() -> DataSpace {
        CLINICAL.clone()
    }

    /// Flat collections of samples
    pub fn samples() -> DataSpace {
        SAMPLES.clone()
    }

    /// Look up a built-in space by name
    pub fn builtin(name: &str) -> Option<DataSpace> {
        match name {
            "clinical" => Some(Self::clinical()),
            "samples" => Some(Self::samples()),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of axes
    pub fn width(&self) -> usize {
        self.inner.axes.len()
    }

    pub fn root(&self) -> Frequency {
        Frequency::ROOT
    }

    pub fn leaf(&self) -> Frequency {
        Frequency((1u32 << self.width()) - 1)
    }

    pub fn contains(&self, freq: Frequency) -> bool {
        self.leaf().is_superset(freq)
    }

    /// All 2^N frequencies in ascending mask order
    pub fn frequencies(&self) -> impl Iterator<Item = Frequency> + '_ {
        (0..self.inner.names.len() as u32).map(Frequency)
    }

    /// Single-axis frequencies in bit order
    pub fn basis(&self) -> Vec<Frequency> {
        (0..self.width() as u32).map(Frequency::axis).collect()
    }

    pub fn axis_names(&self) -> &[String] {
        &self.inner.axes
    }

    /// Name of the axis at bit `index`
    pub fn axis_name(&self, index: usize) -> Option<&str> {
        self.inner.axes.get(index).map(String::as_str)
    }

    /// Compose a frequency from named components (axes or other frequencies)
    pub fn compose(&self, parts: &[&str]) -> Result<Frequency> {
        parts
            .iter()
            .try_fold(Frequency::ROOT, |acc, part| Ok(acc | self.parse(part)?))
    }

    pub fn is_superset(&self, a: Frequency, b: Frequency) -> bool {
        a.is_superset(b)
    }

    /// Axes of `freq`, most significant bit first
    pub fn decompose(&self, freq: Frequency) -> Result<Vec<Frequency>> {
        self.check(freq)?;
        Ok(freq.span())
    }

    pub fn name_of(&self, freq: Frequency) -> Result<&str> {
        self.inner
            .names
            .get(freq.0 as usize)
            .map(String::as_str)
            .ok_or_else(|| DataError::UnknownFrequency {
                space: self.inner.name.clone(),
                name: freq.to_string(),
            })
    }

    /// Resolve a frequency name (also accepts `<space>[<name>]`)
    pub fn parse(&self, name: &str) -> Result<Frequency> {
        let bare = match name.strip_prefix(self.name()) {
            Some(rest) if rest.starts_with('[') && rest.ends_with(']') => &rest[1..rest.len() - 1],
            _ => name,
        };
        self.inner
            .lookup
            .get(bare)
            .copied()
            .ok_or_else(|| DataError::UnknownFrequency {
                space: self.inner.name.clone(),
                name: name.to_string(),
            })
    }

    /// Persisted form of a frequency, e.g. `clinical[session]`
    pub fn qualified(&self, freq: Frequency) -> Result<String> {
        Ok(format!("{}[{}]", self.name(), self.name_of(freq)?))
    }

    fn check(&self, freq: Frequency) -> Result<()> {
        if self.contains(freq) {
            Ok(())
        } else {
            Err(DataError::UnknownFrequency {
                space: self.inner.name.clone(),
                name: freq.to_string(),
            })
        }
    }
}

impl fmt::Display for DataSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

/// Builder for [`DataSpace`]
///
/// Axes are assigned bits in declaration order (first axis = least
/// significant bit). Single-axis frequencies are named after their axis;
/// every other mask must be named with [`DataSpaceBuilder::frequency`]
/// except mask 0, which defaults to `dataset`.
#[derive(Debug, Clone)]
pub struct DataSpaceBuilder {
    name: String,
    axes: Vec<String>,
    frequencies: Vec<(String, Vec<String>)>,
}

impl DataSpaceBuilder {
    pub fn axis(mut self, name: impl Into<String>) -> Self {
        self.axes.push(name.into());
        self
    }

    /// Name the combination of `axes`
    pub fn frequency(mut self, name: impl Into<String>, axes: &[&str]) -> Self {
        self.frequencies
            .push((name.into(), axes.iter().map(|a| a.to_string()).collect()));
        self
    }

    pub fn build(self) -> Result<DataSpace> {
        let space = self.name.clone();
        let fail = |reason: String| DataError::malformed_space(space.clone(), reason);

        if self.axes.is_empty() {
            return Err(fail("no axes declared".into()));
        }
        if self.axes.len() > MAX_AXES {
            return Err(fail(format!(
                "{} axes declared, at most {} supported",
                self.axes.len(),
                MAX_AXES
            )));
        }

        let mut names: Vec<Option<String>> = vec![None; 1 << self.axes.len()];
        for (i, axis) in self.axes.iter().enumerate() {
            if self.axes[..i].contains(axis) {
                return Err(fail(format!("axis '{}' declared twice", axis)));
            }
            names[1 << i] = Some(axis.clone());
        }

        for (name, parts) in &self.frequencies {
            let mut mask = 0u32;
            for part in parts {
                let index = self
                    .axes
                    .iter()
                    .position(|a| a == part)
                    .ok_or_else(|| fail(format!("'{}' combines unknown axis '{}'", name, part)))?;
                mask |= 1 << index;
            }
            if let Some(existing) = &names[mask as usize] {
                return Err(fail(format!(
                    "mask {:#b} named twice ('{}' and '{}')",
                    mask, existing, name
                )));
            }
            names[mask as usize] = Some(name.clone());
        }
        if names[0].is_none() {
            names[0] = Some(DATASET_FREQUENCY.to_string());
        }

        let missing: Vec<String> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_none())
            .map(|(mask, _)| {
                let axes: Vec<&str> = Frequency(mask as u32)
                    .axis_indices()
                    .into_iter()
                    .map(|i| self.axes[i].as_str())
                    .collect();
                format!("{:#b} ({})", mask, axes.join("+"))
            })
            .collect();
        if !missing.is_empty() {
            return Err(fail(format!("unnamed frequencies: {}", missing.join(", "))));
        }

        let names: Vec<String> = names.into_iter().flatten().collect();
        let mut lookup = HashMap::with_capacity(names.len());
        for (mask, name) in names.iter().enumerate() {
            if lookup.insert(name.clone(), Frequency(mask as u32)).is_some() {
                return Err(fail(format!("name '{}' used for two masks", name)));
            }
        }

        Ok(DataSpace {
            inner: Arc::new(SpaceInner {
                name: self.name,
                axes: self.axes,
                names,
                lookup,
            }),
        })
    }
}
