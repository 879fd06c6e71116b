//! Provenance fingerprints and staleness checks
//!
//! A derived item is up to date when the record stored next to it names the
//! same pipeline, the same values for the parameters that pipeline declares,
//! the same digests for every consumed input and the digest the item still
//! has in the store.

use cohort_storage::ProvenanceRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// What one pipeline invocation at one row depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub pipeline: String,
    pub parameters: BTreeMap<String, Value>,
    /// Input column -> digests in consumption order
    pub inputs: BTreeMap<String, Vec<String>>,
}

impl Fingerprint {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            parameters: BTreeMap::new(),
            inputs: BTreeMap::new(),
        }
    }

    /// Record to store next to outputs with the given digests
    pub fn to_record(&self, outputs: BTreeMap<String, String>) -> ProvenanceRecord {
        let mut record = ProvenanceRecord::new(self.pipeline.clone());
        record.parameters = self.parameters.clone();
        record.inputs = self.inputs.clone();
        record.outputs = outputs;
        record
    }
}

/// Outcome of comparing a stored record with the current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "columns", rename_all = "snake_case")]
pub enum Staleness {
    /// No record was stored
    Missing,
    PipelineChanged,
    ParameterChanged(Vec<String>),
    InputChanged(Vec<String>),
    /// Output items that are no longer in the store
    OutputMissing(Vec<String>),
    /// Output items replaced since they were derived
    OutputChanged(Vec<String>),
    UpToDate,
}

impl Staleness {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Staleness::UpToDate)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Missing => write!(f, "no provenance record"),
            Staleness::PipelineChanged => write!(f, "produced by another pipeline"),
            Staleness::ParameterChanged(names) => {
                write!(f, "parameters changed: {}", names.join(", "))
            }
            Staleness::InputChanged(names) => write!(f, "inputs changed: {}", names.join(", ")),
            Staleness::OutputMissing(names) => write!(f, "outputs missing: {}", names.join(", ")),
            Staleness::OutputChanged(names) => {
                write!(f, "outputs replaced: {}", names.join(", "))
            }
            Staleness::UpToDate => write!(f, "up to date"),
        }
    }
}

/// Compare `stored` with `current` and the digests outputs have now
///
/// `outputs` maps every output column to its current digest, `None` when
/// the store holds no item for it.
pub fn check(
    stored: Option<&ProvenanceRecord>,
    current: &Fingerprint,
    outputs: &BTreeMap<String, Option<String>>,
) -> Staleness {
    let Some(stored) = stored else {
        return Staleness::Missing;
    };
    if stored.pipeline != current.pipeline {
        return Staleness::PipelineChanged;
    }

    let parameters = changed_keys(&stored.parameters, &current.parameters);
    if !parameters.is_empty() {
        return Staleness::ParameterChanged(parameters);
    }
    let inputs = changed_keys(&stored.inputs, &current.inputs);
    if !inputs.is_empty() {
        return Staleness::InputChanged(inputs);
    }

    let mut missing = Vec::new();
    let mut replaced = Vec::new();
    for (column, digest) in outputs {
        match (digest, stored.outputs.get(column)) {
            (None, _) => missing.push(column.clone()),
            (Some(now), Some(then)) if now == then => {}
            (Some(_), _) => replaced.push(column.clone()),
        }
    }
    if !missing.is_empty() {
        return Staleness::OutputMissing(missing);
    }
    if !replaced.is_empty() {
        return Staleness::OutputChanged(replaced);
    }
    Staleness::UpToDate
}

/// Keys present in either map whose values differ
fn changed_keys<V: PartialEq>(a: &BTreeMap<String, V>, b: &BTreeMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = a
        .iter()
        .filter(|(k, v)| b.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    for k in b.keys() {
        if !a.contains_key(k) {
            keys.push(k.clone());
        }
    }
    keys.sort();
    keys
}
