//! Core domain models for the docflow orchestration engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine, including tasks, artifacts and the execution plan.

pub mod plan;
pub mod task;

pub use plan::{validate_sequence, ExecutionPlan};
pub use task::{
    Artifact, DependencyOutputs, ImprovementContext, InputBuilder, QualityFlag, QualityReport,
    Task, TaskId, TaskInput, TaskKind, TaskState,
};
