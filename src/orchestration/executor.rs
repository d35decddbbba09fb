//! Runs one task: build input, dispatch, gate.

use crate::core::task::{Artifact, DependencyOutputs, Task};
use crate::error::DispatchError;
use crate::orchestration::dispatcher::RateLimitedDispatcher;
use crate::orchestration::quality::{QualityGate, QualityPolicy};
use std::sync::Arc;
use tracing::debug;

/// Shared task executor used by both stages.
#[derive(Debug)]
pub struct TaskExecutor {
    dispatcher: Arc<RateLimitedDispatcher>,
    gate: Option<Arc<QualityGate>>,
    policy: QualityPolicy,
}

impl TaskExecutor {
    /// Executor without a quality gate; thresholds are ignored.
    pub fn new(dispatcher: Arc<RateLimitedDispatcher>) -> Self {
        Self {
            dispatcher,
            gate: None,
            policy: QualityPolicy::default(),
        }
    }

    pub fn with_gate(dispatcher: Arc<RateLimitedDispatcher>, gate: Arc<QualityGate>) -> Self {
        let policy = gate.policy().clone();
        Self {
            dispatcher,
            gate: Some(gate),
            policy,
        }
    }

    pub fn dispatcher(&self) -> &Arc<RateLimitedDispatcher> {
        &self.dispatcher
    }

    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    /// Threshold for `task`. `required` tasks fall back to the default.
    pub fn threshold_for(&self, task: &Task, required: bool) -> Option<f64> {
        if required {
            Some(self.policy.required_threshold(task))
        } else {
            self.policy.optional_threshold(task)
        }
    }

    /// Execute `task` against its dependencies' artifacts.
    ///
    /// Only dispatch errors fail a task; quality misses are annotated on the
    /// returned artifact.
    pub async fn execute(
        &self,
        task: &Task,
        dependencies: &DependencyOutputs,
        threshold: Option<f64>,
    ) -> Result<Artifact, DispatchError> {
        let input = task.build_input(dependencies);
        let dispatched = self.dispatcher.dispatch(&task.kind, &input).await?;
        debug!(
            task_id = %task.id,
            attempts = dispatched.attempts,
            cached = dispatched.cached,
            "task output generated"
        );

        let artifact = Artifact::new(task.id.clone(), dispatched.output);
        match (&self.gate, threshold) {
            (Some(gate), Some(threshold)) => Ok(gate.gate(artifact, &input, &task.kind, threshold).await),
            _ => Ok(artifact),
        }
    }
}
