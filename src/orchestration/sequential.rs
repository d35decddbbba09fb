//! Sequential stage for foundational tasks.
//!
//! Tasks run strictly in order, one at a time, each through the quality
//! gate. A task's input builder sees every artifact finalized before it.
//! An executor failure halts the stage.

use crate::core::plan::validate_sequence;
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::Result;
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::progress::ProgressSink;
use crate::orchestration::store::ResultStore;
use crate::workflow::StageReport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct SequentialStage {
    executor: Arc<TaskExecutor>,
    store: ResultStore,
    progress: ProgressSink,
    cancel: CancellationToken,
}

impl SequentialStage {
    pub fn new(executor: Arc<TaskExecutor>, store: ResultStore) -> Self {
        Self {
            executor,
            store,
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn set_state(&self, report: &mut StageReport, id: &TaskId, state: TaskState) {
        self.progress.task_state(id, &state);
        report.states.insert(id.clone(), state);
    }

    /// Run `tasks` in order.
    ///
    /// # Errors
    /// Only configuration defects: a duplicate ID or a task depending on one
    /// that does not run before it. Task failures are reported in the
    /// returned [`StageReport`].
    pub async fn run(&self, tasks: &[Task]) -> Result<StageReport> {
        validate_sequence(tasks)?;
        info!(tasks = tasks.len(), "sequential stage starting");

        let mut report = StageReport::default();
        let mut halted_by: Option<TaskId> = None;

        for task in tasks {
            if let Some(failed) = &halted_by {
                self.set_state(
                    &mut report,
                    &task.id,
                    TaskState::Skipped {
                        dependency: failed.clone(),
                    },
                );
                continue;
            }
            if self.cancel.is_cancelled() {
                self.set_state(&mut report, &task.id, TaskState::Cancelled);
                report.cancelled = true;
                continue;
            }

            self.set_state(&mut report, &task.id, TaskState::Ready);
            self.set_state(&mut report, &task.id, TaskState::Running);

            let finalized = self.store.snapshot().await;
            let threshold = self.executor.threshold_for(task, true);
            match self.executor.execute(task, &finalized, threshold).await {
                Ok(artifact) => {
                    if artifact.is_below_threshold() {
                        warn!(task_id = %task.id, "foundational artifact below threshold");
                    }
                    self.store.insert(task.id.clone(), artifact).await?;
                    self.set_state(&mut report, &task.id, TaskState::Completed);
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "foundational task failed, halting stage");
                    self.set_state(
                        &mut report,
                        &task.id,
                        TaskState::Failed {
                            error: err.to_string(),
                        },
                    );
                    report.halted = true;
                    halted_by = Some(task.id.clone());
                }
            }
        }

        info!(
            completed = report.count("completed"),
            halted = report.halted,
            cancelled = report.cancelled,
            "sequential stage finished"
        );
        Ok(report)
    }
}
