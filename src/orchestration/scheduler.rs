//! Scheduler for parallel task execution.
//!
//! The DependencyScheduler drives an [`ExecutionPlan`] under bounded
//! concurrency. Ready tasks start in FIFO order while capacity remains;
//! each completion immediately unblocks the dependents whose last unmet
//! dependency it was. A failed task marks its transitive dependents
//! `Skipped` instead of failing them.

use crate::core::plan::ExecutionPlan;
use crate::core::task::{Artifact, Task, TaskId, TaskState};
use crate::error::{PlanError, Result};
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::progress::ProgressSink;
use crate::orchestration::store::ResultStore;
use crate::workflow::StageReport;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of tasks run at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 8;

type TaskResult = (TaskId, std::result::Result<Artifact, String>);

/// Executes a task graph with bounded concurrency.
///
/// # Example
///
/// ```ignore
/// let plan = ExecutionPlan::build(tasks, store_ids)?;
/// let scheduler = DependencyScheduler::new(executor, store, 4);
/// let report = scheduler.run(&plan).await?;
/// ```
pub struct DependencyScheduler {
    executor: Arc<TaskExecutor>,
    store: ResultStore,
    progress: ProgressSink,
    cancel: CancellationToken,
    max_parallelism: usize,
}

/// Bookkeeping for one `run` call.
struct RunBook {
    states: BTreeMap<TaskId, TaskState>,
    remaining: HashMap<TaskId, usize>,
    ready: VecDeque<TaskId>,
    /// Join-set ids of running tasks, so an aborted join still names its task.
    launched: HashMap<Id, TaskId>,
}

impl RunBook {
    fn new(plan: &ExecutionPlan) -> Self {
        Self {
            states: plan
                .tasks()
                .map(|t| (t.id.clone(), TaskState::Pending))
                .collect(),
            remaining: plan.in_degrees(),
            ready: VecDeque::new(),
            launched: HashMap::new(),
        }
    }
}

impl DependencyScheduler {
    pub fn new(executor: Arc<TaskExecutor>, store: ResultStore, max_parallelism: usize) -> Self {
        Self {
            executor,
            store,
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
            max_parallelism: max_parallelism.max(1),
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

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Build a plan from `tasks` and run it.
    ///
    /// Dependencies already present in the result store count as satisfied.
    pub async fn run_tasks(&self, tasks: Vec<Task>) -> Result<StageReport> {
        let satisfied: Vec<TaskId> = self.store.snapshot().await.into_keys().collect();
        let plan = ExecutionPlan::build(tasks, satisfied)?;
        self.run(&plan).await
    }

    /// Run every task in `plan` to a terminal state.
    ///
    /// # Errors
    /// Only plan validation: a dependency declared as satisfied that has no
    /// artifact in the store. Task failures are recorded, never raised.
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<StageReport> {
        for task in plan.tasks() {
            for dependency in &task.dependencies {
                if !plan.contains_task(dependency) && !self.store.contains(dependency).await {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
            }
        }

        info!(
            tasks = plan.task_count(),
            max_parallelism = self.max_parallelism,
            "dependency scheduler starting"
        );

        let mut book = RunBook::new(plan);
        for task in plan.tasks() {
            if book.remaining.get(&task.id).copied().unwrap_or(0) == 0 {
                self.mark_ready(&mut book, &task.id);
            }
        }

        let mut running: JoinSet<TaskResult> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                info!(running = running.len(), "cancellation requested, draining running tasks");
                cancelled = true;
            }

            while !cancelled && running.len() < self.max_parallelism {
                let Some(task_id) = book.ready.pop_front() else {
                    break;
                };
                if let Some(task) = plan.get_task(&task_id) {
                    self.launch(&mut running, &mut book, task);
                }
            }

            if running.is_empty() {
                break;
            }

            let joined = if cancelled {
                running.join_next_with_id().await
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => continue,
                    joined = running.join_next_with_id() => joined,
                }
            };

            let Some(joined) = joined else {
                break;
            };
            self.settle(plan, &mut book, joined).await;
        }

        let mut report = StageReport::default();
        for (task_id, state) in book.states.iter_mut() {
            if state.is_terminal() {
                continue;
            }
            let terminal = if cancelled {
                report.cancelled = true;
                TaskState::Cancelled
            } else {
                error!(task_id = %task_id, state = state.label(), "task never reached a terminal state");
                TaskState::Failed {
                    error: "task did not finish".into(),
                }
            };
            self.progress.task_state(task_id, &terminal);
            *state = terminal;
        }
        report.states = book.states;

        info!(
            completed = report.count("completed"),
            failed = report.count("failed"),
            skipped = report.count("skipped"),
            cancelled = report.count("cancelled"),
            "dependency scheduler finished"
        );
        Ok(report)
    }

    fn set_state(&self, book: &mut RunBook, task_id: &TaskId, state: TaskState) {
        self.progress.task_state(task_id, &state);
        book.states.insert(task_id.clone(), state);
    }

    fn mark_ready(&self, book: &mut RunBook, task_id: &TaskId) {
        self.set_state(book, task_id, TaskState::Ready);
        book.ready.push_back(task_id.clone());
    }

    fn launch(&self, running: &mut JoinSet<TaskResult>, book: &mut RunBook, task: &Task) {
        self.set_state(book, &task.id, TaskState::Running);
        debug!(task_id = %task.id, kind = %task.kind, "task started");

        let task = task.clone();
        let executor = Arc::clone(&self.executor);
        let store = self.store.clone();
        let threshold = executor.threshold_for(&task, false);
        let launched_id = task.id.clone();

        let handle = running.spawn(async move {
            let task_id = task.id.clone();
            let work = async move {
                let dependencies = store.select(task.dependencies.iter()).await;
                executor
                    .execute(&task, &dependencies, threshold)
                    .await
                    .map_err(|e| e.to_string())
            };
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));
            (task_id, outcome)
        });
        book.launched.insert(handle.id(), launched_id);
    }

    /// Apply one joined task's outcome to the book.
    async fn settle(
        &self,
        plan: &ExecutionPlan,
        book: &mut RunBook,
        joined: std::result::Result<(Id, TaskResult), JoinError>,
    ) {
        match joined {
            Ok((id, (task_id, outcome))) => {
                book.launched.remove(&id);
                match outcome {
                    Ok(artifact) => self.complete(plan, book, task_id, artifact).await,
                    Err(error) => self.fail(plan, book, task_id, error),
                }
            }
            Err(join_err) => match book.launched.remove(&join_err.id()) {
                Some(task_id) => {
                    error!(task_id = %task_id, error = %join_err, "scheduled task aborted");
                    self.fail(plan, book, task_id, format!("task aborted: {}", join_err));
                }
                None => error!(error = %join_err, "unknown scheduled task aborted"),
            },
        }
    }

    async fn complete(&self, plan: &ExecutionPlan, book: &mut RunBook, task_id: TaskId, artifact: Artifact) {
        if let Err(err) = self.store.insert(task_id.clone(), artifact).await {
            self.fail(plan, book, task_id, err.to_string());
            return;
        }
        self.set_state(book, &task_id, TaskState::Completed);
        debug!(task_id = %task_id, "task completed");

        for dependent in plan.dependents(&task_id) {
            if book.states.get(dependent) != Some(&TaskState::Pending) {
                continue;
            }
            let Some(remaining) = book.remaining.get_mut(dependent) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.mark_ready(book, dependent);
            }
        }
    }

    fn fail(&self, plan: &ExecutionPlan, book: &mut RunBook, task_id: TaskId, error: String) {
        warn!(task_id = %task_id, error = %error, "task failed");
        self.set_state(book, &task_id, TaskState::Failed { error });

        let mut frontier = VecDeque::from([task_id]);
        while let Some(blocked) = frontier.pop_front() {
            for dependent in plan.dependents(&blocked) {
                if book.states.get(dependent) != Some(&TaskState::Pending) {
                    continue;
                }
                debug!(task_id = %dependent, dependency = %blocked, "skipping task");
                self.set_state(
                    book,
                    dependent,
                    TaskState::Skipped {
                        dependency: blocked.clone(),
                    },
                );
                frontier.push_back(dependent.clone());
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", msg)
    } else {
        "task panicked".to_string()
    }
}
