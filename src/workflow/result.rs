//! Aggregate outcome of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::task::{Artifact, TaskId, TaskState};
use crate::orchestration::DispatchStats;

use super::state::PhaseHistoryEntry;
use super::{RunId, RunStatus};

/// Final record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Final score if the artifact was gated, else the original score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl TaskOutcome {
    pub fn new(state: TaskState, artifact: Option<Artifact>) -> Self {
        let score = artifact
            .as_ref()
            .and_then(|a| a.score.or_else(|| a.original_score()));
        Self {
            state,
            artifact,
            score,
        }
    }
}

/// Task states reported by one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub states: BTreeMap<TaskId, TaskState>,
    /// A task failed and the stage stopped early.
    pub halted: bool,
    /// Cancellation stopped the stage before every task finished.
    pub cancelled: bool,
}

impl StageReport {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_states(self.states.values(), self.halted, self.cancelled)
    }

    pub fn count(&self, label: &str) -> usize {
        self.states.values().filter(|s| s.label() == label).count()
    }

    /// Fold `other` into this report.
    pub fn merge(&mut self, other: StageReport) {
        self.states.extend(other.states);
        self.halted |= other.halted;
        self.cancelled |= other.cancelled;
    }
}

impl RunStatus {
    /// Derive a status from final task states.
    ///
    /// - every task completed: `Complete`
    /// - cancellation fired: `Cancelled`
    /// - the sequential stage halted: `Partial`
    /// - nothing completed and something failed: `Failed`
    /// - anything else: `Partial`
    pub fn from_states<'a, I>(states: I, halted: bool, cancelled: bool) -> RunStatus
    where
        I: IntoIterator<Item = &'a TaskState>,
    {
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut total = 0usize;
        for state in states {
            total += 1;
            match state {
                TaskState::Completed => completed += 1,
                TaskState::Failed { .. } => failed += 1,
                _ => {}
            }
        }

        if completed == total && !halted {
            RunStatus::Complete
        } else if cancelled {
            RunStatus::Cancelled
        } else if halted {
            RunStatus::Partial
        } else if completed == 0 && failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// Everything a run produced, handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tasks: BTreeMap<TaskId, TaskOutcome>,
    /// Error reported by the finalization hook, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub phase_history: Vec<PhaseHistoryEntry>,
    #[serde(default)]
    pub dispatch_stats: DispatchStats,
}

impl RunResult {
    pub fn state(&self, task_id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(task_id).map(|o| &o.state)
    }

    pub fn artifact(&self, task_id: &TaskId) -> Option<&Artifact> {
        self.tasks.get(task_id).and_then(|o| o.artifact.as_ref())
    }

    pub fn count(&self, label: &str) -> usize {
        self.tasks.values().filter(|o| o.state.label() == label).count()
    }

    /// Completed artifacts, keyed by task.
    pub fn artifacts(&self) -> BTreeMap<TaskId, Artifact> {
        self.tasks
            .iter()
            .filter_map(|(id, o)| o.artifact.clone().map(|a| (id.clone(), a)))
            .collect()
    }

    /// Tasks whose artifact was accepted below its threshold.
    pub fn below_threshold(&self) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .filter(|(_, o)| o.artifact.as_ref().is_some_and(Artifact::is_below_threshold))
            .map(|(id, _)| id)
            .collect()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "run {} {}: {} completed, {} failed, {} skipped, {} cancelled",
            self.run_id.short(),
            self.status,
            self.count("completed"),
            self.count("failed"),
            self.count("skipped"),
            self.count("cancelled"),
        );
        let below = self.below_threshold().len();
        if below > 0 {
            line.push_str(&format!(" ({} below threshold)", below));
        }
        if let Some(err) = &self.finalize_error {
            line.push_str(&format!("; finalize failed: {}", err));
        }
        line
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
