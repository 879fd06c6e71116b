//! Per-row outcome of a derivation request

use cohort_core::RowKey;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::{DerivationState, DerivationStateMachine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DerivationStatus {
    /// Nothing to do, stored items match their provenance
    UpToDate,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub sink: String,
    pub row: RowKey,
    pub status: DerivationStatus,
}

/// Partial-success result of [`crate::Deriver::derive`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivationReport {
    /// One entry per visited (sink, row), ordered by sink then row
    pub entries: Vec<ReportEntry>,
    /// Task nodes handed to the engine
    pub invocations: usize,
    pub duration_ms: u64,
}

impl DerivationReport {
    pub fn from_states<'a, I>(states: I, invocations: usize, duration_ms: u64) -> Self
    where
        I: IntoIterator<Item = &'a DerivationStateMachine>,
    {
        let entries = states
            .into_iter()
            .map(|sm| ReportEntry {
                sink: sm.sink.clone(),
                row: sm.row.clone(),
                status: match sm.state() {
                    DerivationState::UpToDate { .. } => DerivationStatus::UpToDate,
                    DerivationState::Completed { .. } => DerivationStatus::Completed,
                    DerivationState::Failed { error, .. } => DerivationStatus::Failed(error.clone()),
                    other => DerivationStatus::Failed(format!(
                        "derivation stopped in state {}",
                        other.state_name()
                    )),
                },
            })
            .collect();
        Self {
            entries,
            invocations,
            duration_ms,
        }
    }

    pub fn status(&self, sink: &str, row: &RowKey) -> Option<&DerivationStatus> {
        self.entries
            .iter()
            .find(|e| e.sink == sink && &e.row == row)
            .map(|e| &e.status)
    }

    pub fn succeeded(&self) -> Vec<&ReportEntry> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.status, DerivationStatus::Failed(_)))
            .collect()
    }

    pub fn failed(&self) -> Vec<&ReportEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, DerivationStatus::Failed(_)))
            .collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed().is_empty()
    }
}

impl fmt::Display for DerivationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let up_to_date = self
            .entries
            .iter()
            .filter(|e| e.status == DerivationStatus::UpToDate)
            .count();
        write!(
            f,
            "{} derived, {} up to date, {} failed ({} invocations in {}ms)",
            self.succeeded().len() - up_to_date,
            up_to_date,
            self.failed().len(),
            self.invocations,
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_partial_success() {
        let mut done = DerivationStateMachine::new("mask", RowKey::root());
        done.start_check().unwrap();
        done.needs_recompute("no provenance record").unwrap();
        done.schedule(0).unwrap();
        done.complete().unwrap();

        let mut broken = DerivationStateMachine::new("report", RowKey::root());
        broken.start_check().unwrap();
        broken
            .fail("no guard matched".into(), ErrorCategory::Permanent)
            .unwrap();

        let report = DerivationReport::from_states([&done, &broken], 1, 12);
        assert!(!report.is_complete_success());
        assert_eq!(report.succeeded().len(), 1);
        assert_eq!(
            report.status("report", &RowKey::root()),
            Some(&DerivationStatus::Failed("no guard matched".into()))
        );
        assert_eq!(
            report.to_string(),
            "1 derived, 0 up to date, 1 failed (1 invocations in 12ms)"
        );
    }
}
