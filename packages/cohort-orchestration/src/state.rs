use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use cohort_core::RowKey;
use serde::{Deserialize, Serialize};

/// Derivation state of one sink column at one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DerivationState {
    Unrequested,
    Checking {
        started_at: DateTime<Utc>,
    },
    UpToDate {
        checked_at: DateTime<Utc>,
    },
    NeedsRecompute {
        reason: String,
    },
    Scheduled {
        /// Index of the task node in the plan's graph
        task: usize,
        scheduled_at: DateTime<Utc>,
    },
    Completed {
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        error_category: ErrorCategory,
    },
}

impl DerivationState {
    pub fn state_name(&self) -> &'static str {
        match self {
            DerivationState::Unrequested => "unrequested",
            DerivationState::Checking { .. } => "checking",
            DerivationState::UpToDate { .. } => "up_to_date",
            DerivationState::NeedsRecompute { .. } => "needs_recompute",
            DerivationState::Scheduled { .. } => "scheduled",
            DerivationState::Completed { .. } => "completed",
            DerivationState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DerivationState::UpToDate { .. }
                | DerivationState::Completed { .. }
                | DerivationState::Failed { .. }
        )
    }
}

/// State machine for transitions
#[derive(Debug, Clone)]
pub struct DerivationStateMachine {
    pub sink: String,
    pub row: RowKey,
    state: DerivationState,
    updated_at: DateTime<Utc>,
}

impl DerivationStateMachine {
    pub fn new(sink: impl Into<String>, row: RowKey) -> Self {
        Self {
            sink: sink.into(),
            row,
            state: DerivationState::Unrequested,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &DerivationState {
        &self.state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    fn set(&mut self, state: DerivationState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Transition: UNREQUESTED → CHECKING
    pub fn start_check(&mut self) -> Result<()> {
        match &self.state {
            DerivationState::Unrequested => {
                self.set(DerivationState::Checking {
                    started_at: Utc::now(),
                });
                Ok(())
            }
            _ => Err(self.invalid("checking")),
        }
    }

    /// Transition: CHECKING → UP_TO_DATE
    pub fn up_to_date(&mut self) -> Result<()> {
        match &self.state {
            DerivationState::Checking { .. } => {
                self.set(DerivationState::UpToDate {
                    checked_at: Utc::now(),
                });
                Ok(())
            }
            _ => Err(self.invalid("up_to_date")),
        }
    }

    /// Transition: CHECKING → NEEDS_RECOMPUTE
    pub fn needs_recompute(&mut self, reason: impl Into<String>) -> Result<()> {
        match &self.state {
            DerivationState::Checking { .. } => {
                self.set(DerivationState::NeedsRecompute {
                    reason: reason.into(),
                });
                Ok(())
            }
            _ => Err(self.invalid("needs_recompute")),
        }
    }

    /// Transition: NEEDS_RECOMPUTE → SCHEDULED
    pub fn schedule(&mut self, task: usize) -> Result<()> {
        match &self.state {
            DerivationState::NeedsRecompute { .. } => {
                self.set(DerivationState::Scheduled {
                    task,
                    scheduled_at: Utc::now(),
                });
                Ok(())
            }
            _ => Err(self.invalid("scheduled")),
        }
    }

    /// Transition: SCHEDULED → COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        match &self.state {
            DerivationState::Scheduled { scheduled_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *scheduled_at).num_milliseconds().max(0) as u64;
                self.set(DerivationState::Completed {
                    completed_at: now,
                    duration_ms,
                });
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: CHECKING | NEEDS_RECOMPUTE | SCHEDULED → FAILED
    pub fn fail(&mut self, error: String, error_category: ErrorCategory) -> Result<()> {
        match &self.state {
            DerivationState::Checking { .. }
            | DerivationState::NeedsRecompute { .. }
            | DerivationState::Scheduled { .. } => {
                self.set(DerivationState::Failed {
                    failed_at: Utc::now(),
                    error,
                    error_category,
                });
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DerivationStateMachine {
        DerivationStateMachine::new("concatenated", RowKey::root())
    }

    #[test]
    fn test_state_transitions() {
        let mut sm = machine();
        assert_eq!(sm.state().state_name(), "unrequested");

        sm.start_check().unwrap();
        assert_eq!(sm.state().state_name(), "checking");

        sm.needs_recompute("no provenance record").unwrap();
        sm.schedule(3).unwrap();
        assert!(matches!(sm.state(), DerivationState::Scheduled { task: 3, .. }));

        sm.complete().unwrap();
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn test_up_to_date_is_terminal() {
        let mut sm = machine();
        sm.start_check().unwrap();
        sm.up_to_date().unwrap();
        assert!(sm.state().is_terminal());
        assert!(sm.needs_recompute("late").is_err());
        assert!(sm.fail("late".into(), ErrorCategory::Permanent).is_err());
    }

    #[test]
    fn test_invalid_state_transition() {
        let mut sm = machine();

        // Cannot complete from UNREQUESTED
        let result = sm.complete();
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidStateTransition { ref from, ref to })
                if from == "unrequested" && to == "completed"
        ));

        // Cannot schedule without a recompute decision
        sm.start_check().unwrap();
        assert!(sm.schedule(0).is_err());
    }

    #[test]
    fn test_fail_from_scheduled() {
        let mut sm = machine();
        sm.start_check().unwrap();
        sm.needs_recompute("inputs changed: file1").unwrap();
        sm.schedule(0).unwrap();
        sm.fail("boom".into(), ErrorCategory::Permanent).unwrap();

        match sm.state() {
            DerivationState::Failed {
                error,
                error_category,
                ..
            } => {
                assert_eq!(error, "boom");
                assert_eq!(*error_category, ErrorCategory::Permanent);
            }
            other => panic!("Expected Failed state, got {:?}", other),
        }
    }

    #[test]
    fn test_state_serde() {
        let state = DerivationState::NeedsRecompute {
            reason: "no provenance record".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], "needs_recompute");
        let back: DerivationState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
