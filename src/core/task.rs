//! Task data model for the orchestration engine.
//!
//! Tasks are the atomic units of generation work. Each task declares the
//! tasks it depends on, knows how to build its input from their artifacts,
//! and optionally carries a quality threshold its artifact must meet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a task within a run.
///
/// Callers pick the identifier (e.g. `"requirements"`), and it stays stable
/// for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selector for the generation routine a task invokes.
///
/// The engine treats kinds as opaque; a [`CapabilityRegistry`] maps each one
/// to a generator when the plan is built.
///
/// [`CapabilityRegistry`]: crate::orchestration::CapabilityRegistry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(pub String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured feedback handed to an improvement call.
///
/// `diagnostics` is the scorer's bundle, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementContext {
    /// Content of the version being improved.
    pub previous_output: String,
    /// Score the previous version received.
    pub score: f64,
    /// Threshold the previous version missed.
    pub threshold: f64,
    /// Scorer diagnostic bundle, verbatim.
    pub diagnostics: serde_json::Value,
    /// Improvement round, starting at 1.
    pub round: u32,
}

/// Concrete input for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Prompt text sent to the capability.
    pub prompt: String,
    /// Expected output size, used to size the call deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_tokens: Option<u32>,
    /// Present only on improvement calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<ImprovementContext>,
}

impl TaskInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            expected_output_tokens: None,
            improvement: None,
        }
    }

    pub fn with_expected_tokens(mut self, tokens: u32) -> Self {
        self.expected_output_tokens = Some(tokens);
        self
    }

    /// Derive an improvement request from this input.
    pub fn for_improvement(&self, context: ImprovementContext) -> Self {
        Self {
            prompt: self.prompt.clone(),
            expected_output_tokens: self.expected_output_tokens,
            improvement: Some(context),
        }
    }
}

/// Artifacts of a task's completed dependencies, keyed by task ID.
pub type DependencyOutputs = BTreeMap<TaskId, Artifact>;

/// Pure function building a task's input from its dependencies' artifacts.
pub type InputBuilder = Arc<dyn Fn(&DependencyOutputs) -> TaskInput + Send + Sync>;

/// A single unit of orchestrated work.
#[derive(Clone)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Which generation routine to invoke.
    pub kind: TaskKind,
    /// Tasks that must complete before this one may start.
    pub dependencies: Vec<TaskId>,
    /// Minimum acceptable score; `None` skips the quality gate unless a
    /// per-kind default applies.
    pub quality_threshold: Option<f64>,
    input_builder: InputBuilder,
}

impl Task {
    /// Create a task with no dependencies and no threshold.
    pub fn new<F>(id: impl Into<TaskId>, kind: impl Into<TaskKind>, input_builder: F) -> Self
    where
        F: Fn(&DependencyOutputs) -> TaskInput + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            kind: kind.into(),
            dependencies: Vec::new(),
            quality_threshold: None,
            input_builder: Arc::new(input_builder),
        }
    }

    /// Add a dependency. Duplicates are ignored.
    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_dependencies<I, T>(self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        dependencies
            .into_iter()
            .fold(self, |task, dep| task.depends_on(dep))
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// Build this task's input from its dependencies' artifacts.
    pub fn build_input(&self, dependencies: &DependencyOutputs) -> TaskInput {
        (self.input_builder)(dependencies)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("quality_threshold", &self.quality_threshold)
            .finish_non_exhaustive()
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Ready -> Running -> {Completed | Failed}`, plus `Skipped`
/// when a dependency failed and `Cancelled` when the run stopped first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// All dependencies completed; waiting for a worker slot.
    Ready,
    /// Executing (including the quality gate).
    Running,
    /// Produced an artifact, possibly flagged below threshold.
    Completed,
    /// The executor returned an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Not run because a dependency failed or was skipped.
    Skipped {
        /// The dependency that ended without an artifact.
        dependency: TaskId,
    },
    /// Not started because the run was cancelled.
    Cancelled,
}

impl TaskState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Failed { .. }
                | TaskState::Skipped { .. }
                | TaskState::Cancelled
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    /// Short label without payload, used in progress events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Skipped { .. } => "skipped",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Failed { error } => write!(f, "failed: {}", error),
            TaskState::Skipped { dependency } => write!(f, "skipped: {} did not complete", dependency),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Annotation attached by the quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "flag")]
pub enum QualityFlag {
    /// The final artifact is not known to meet the threshold.
    BelowThreshold,
    /// The improvement call failed; the original version was kept.
    ImprovementFailed { reason: String },
    /// The scorer failed; the artifact was accepted unscored.
    ScoringFailed { reason: String },
}

/// Quality gate record kept with an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Threshold the artifact was judged against.
    pub threshold: f64,
    /// Score of the first generated version; `None` if the scorer failed.
    pub original_score: Option<f64>,
    /// Score of the returned version, when it was scored.
    pub final_score: Option<f64>,
    /// Number of improvement calls that produced a new version.
    pub improvement_rounds: u32,
    /// Scorer diagnostics for the first version.
    pub diagnostics: serde_json::Value,
    pub flags: Vec<QualityFlag>,
}

/// Immutable output of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Task that produced this artifact.
    pub source_task_id: TaskId,
    /// Generated content.
    pub content: String,
    /// Latest known score, if the artifact went through the gate.
    pub score: Option<f64>,
    /// Number of versions generated (1 + improvement rounds).
    pub attempt_count: u32,
    /// Gate record, absent for ungated tasks.
    pub quality: Option<QualityReport>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a first-version, ungated artifact.
    pub fn new(source_task_id: TaskId, content: impl Into<String>) -> Self {
        Self {
            source_task_id,
            content: content.into(),
            score: None,
            attempt_count: 1,
            quality: None,
            created_at: Utc::now(),
        }
    }

    /// Score of the first generated version.
    pub fn original_score(&self) -> Option<f64> {
        self.quality.as_ref().and_then(|q| q.original_score)
    }

    pub fn has_flag(&self, flag: &QualityFlag) -> bool {
        self.quality
            .as_ref()
            .map(|q| q.flags.contains(flag))
            .unwrap_or(false)
    }

    pub fn is_below_threshold(&self) -> bool {
        self.has_flag(&QualityFlag::BelowThreshold)
    }

    pub fn improvement_failed(&self) -> bool {
        self.quality
            .as_ref()
            .map(|q| {
                q.flags
                    .iter()
                    .any(|f| matches!(f, QualityFlag::ImprovementFailed { .. }))
            })
            .unwrap_or(false)
    }
}
