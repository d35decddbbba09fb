//! Run-level types for the docflow engine.
//!
//! This module tracks a run's identity, its phase and the aggregate result
//! handed to the persistence collaborator.

mod result;
mod state;
mod types;

pub use result::{RunResult, StageReport, TaskOutcome};
pub use state::{PhaseHistoryEntry, RunState};
pub use types::{RunId, RunPhase, RunStatus};
