//! Run state with phase transition validation.
//!
//! `RunState` enforces the phase ordering of a run and keeps a timestamped
//! history of every phase entered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{RunId, RunPhase};

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    /// The phase that was entered.
    pub phase: RunPhase,
    /// When this phase was entered.
    pub entered_at: DateTime<Utc>,
}

/// Tracks the phase of one run.
///
/// Foundation -> Parallel -> Finalize -> Complete
///
/// Foundation and Parallel may jump straight to Complete when the run halts
/// or is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    run_id: RunId,
    phase: RunPhase,
    phase_history: Vec<PhaseHistoryEntry>,
}

impl RunState {
    /// Create a run state in the Foundation phase.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            phase: RunPhase::Foundation,
            phase_history: vec![PhaseHistoryEntry {
                phase: RunPhase::Foundation,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn can_transition(&self, target: RunPhase) -> bool {
        matches!(
            (self.phase, target),
            (RunPhase::Foundation, RunPhase::Parallel)
                | (RunPhase::Foundation, RunPhase::Complete)
                | (RunPhase::Parallel, RunPhase::Finalize)
                | (RunPhase::Parallel, RunPhase::Complete)
                | (RunPhase::Finalize, RunPhase::Complete)
        )
    }

    /// Move to `target`, returning the phase left.
    pub fn transition(&mut self, target: RunPhase) -> Result<RunPhase> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }

        let from = self.phase;
        self.phase = target;
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: Utc::now(),
        });
        Ok(from)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn current_phase(&self) -> RunPhase {
        self.phase
    }

    pub fn phase_history(&self) -> &[PhaseHistoryEntry] {
        &self.phase_history
    }

    pub fn is_complete(&self) -> bool {
        self.phase == RunPhase::Complete
    }
}
