use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskKind};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Execution plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Result already recorded for task {0}")]
    DuplicateResult(TaskId),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a generation or scoring capability.
///
/// The capability must say whether a failure is worth retrying; the
/// dispatcher never guesses from message text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by capability (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("capability rejected request: {0}")]
    Rejected(String),
}

impl GenerationError {
    /// Network failures, timeouts and rate-limit signals are retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Network(_)
                | GenerationError::Timeout(_)
                | GenerationError::RateLimited { .. }
        )
    }
}

/// Terminal outcome of a dispatch that did not produce output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("permanent failure: {0}")]
    Permanent(GenerationError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: GenerationError },

    #[error("no generator registered for capability '{0}'")]
    UnknownCapability(TaskKind),

    #[error("in-flight request was abandoned before producing a result")]
    Interrupted,
}

impl DispatchError {
    /// The underlying capability error, if there was one.
    pub fn source_error(&self) -> Option<&GenerationError> {
        match self {
            DispatchError::Permanent(e) => Some(e),
            DispatchError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// Configuration defects in an execution plan, raised before any task runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("task {0} is declared more than once")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle detected at task {0}")]
    Cycle(TaskId),

    #[error("task {task} uses capability '{kind}' which has no registered generator")]
    UnroutedKind { task: TaskId, kind: TaskKind },

    #[error("sequential task {task} depends on {dependency}, which does not run before it")]
    ForwardReference { task: TaskId, dependency: TaskId },
}
