//! Top-level driver for one run.
//!
//! A `WorkflowOrchestrator` is built for a single run and consumed by
//! [`WorkflowOrchestrator::run`]. It validates both task lists before any
//! task starts, then drives the sequential stage, the dependency scheduler
//! and the finalization hook, and folds everything into a [`RunResult`].

use crate::config::Config;
use crate::core::plan::{validate_sequence, ExecutionPlan};
use crate::core::task::{Artifact, Task, TaskId, TaskState};
use crate::error::Result;
use crate::orchestration::capability::{CapabilityRegistry, Scorer};
use crate::orchestration::dispatcher::{DispatcherConfig, RateLimitedDispatcher};
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::progress::{ProgressEvent, ProgressSink};
use crate::orchestration::quality::{QualityGate, QualityPolicy};
use crate::orchestration::scheduler::DependencyScheduler;
use crate::orchestration::sequential::SequentialStage;
use crate::orchestration::store::ResultStore;
use crate::workflow::{RunId, RunPhase, RunResult, RunState, StageReport, TaskOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hook run once after the parallel stage, e.g. cross-referencing.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, artifacts: &BTreeMap<TaskId, Artifact>) -> std::result::Result<(), String>;
}

/// Finalizer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn finalize(&self, _artifacts: &BTreeMap<TaskId, Artifact>) -> std::result::Result<(), String> {
        Ok(())
    }
}

pub struct WorkflowOrchestrator {
    state: RunState,
    registry: CapabilityRegistry,
    dispatcher: Arc<RateLimitedDispatcher>,
    executor: Arc<TaskExecutor>,
    store: ResultStore,
    progress: ProgressSink,
    cancel: CancellationToken,
    max_parallelism: usize,
}

impl WorkflowOrchestrator {
    /// Build an orchestrator for one run from `config`.
    pub fn new(config: &Config, registry: CapabilityRegistry, scorer: Arc<dyn Scorer>) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(RateLimitedDispatcher::new(
            DispatcherConfig::from(config),
            registry.clone(),
        ));
        let gate = Arc::new(QualityGate::new(
            Arc::clone(&dispatcher),
            scorer,
            QualityPolicy::from(&config.quality),
        ));
        let executor = Arc::new(TaskExecutor::with_gate(Arc::clone(&dispatcher), gate));
        Ok(Self::from_parts(registry, dispatcher, executor, config.max_parallelism))
    }

    /// Assemble from pre-built components.
    pub fn from_parts(
        registry: CapabilityRegistry,
        dispatcher: Arc<RateLimitedDispatcher>,
        executor: Arc<TaskExecutor>,
        max_parallelism: usize,
    ) -> Self {
        Self {
            state: RunState::new(RunId::new()),
            registry,
            dispatcher,
            executor,
            store: ResultStore::new(),
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

    pub fn run_id(&self) -> RunId {
        self.state.run_id()
    }

    /// Token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn dispatcher(&self) -> &Arc<RateLimitedDispatcher> {
        &self.dispatcher
    }

    fn enter(&mut self, phase: RunPhase) -> Result<()> {
        let from = self.state.transition(phase)?;
        info!(run_id = %self.state.run_id().short(), from = %from, to = %phase, "run phase changed");
        self.progress.emit(ProgressEvent::PhaseChanged { from, to: phase });
        Ok(())
    }

    /// Run the workflow.
    ///
    /// # Errors
    /// Plan validation failures (duplicate IDs, cycles, unknown or forward
    /// references, unrouted kinds). These are raised before any task runs.
    /// Task-level failures are reported in the returned [`RunResult`].
    pub async fn run(
        mut self,
        sequential: Vec<Task>,
        parallel: Vec<Task>,
        finalizer: &dyn Finalizer,
    ) -> Result<RunResult> {
        let started_at = Utc::now();

        validate_sequence(&sequential)?;
        self.registry.ensure_routes(&sequential)?;
        let foundation: Vec<TaskId> = sequential.iter().map(|t| t.id.clone()).collect();
        let plan = ExecutionPlan::build(parallel, foundation)?;
        plan.ensure_routed(&self.registry)?;

        info!(
            run_id = %self.state.run_id().short(),
            sequential = sequential.len(),
            parallel = plan.task_count(),
            "run starting"
        );

        let stage = SequentialStage::new(Arc::clone(&self.executor), self.store.clone())
            .with_progress(self.progress.clone())
            .with_cancellation(self.cancel.clone());
        let mut report = stage.run(&sequential).await?;

        let mut finalize_error = None;
        if report.halted || report.cancelled {
            warn!(
                halted = report.halted,
                cancelled = report.cancelled,
                "sequential stage did not finish, skipping parallel stage"
            );
            self.abandon(&plan, &mut report);
        } else {
            self.enter(RunPhase::Parallel)?;
            let scheduler = DependencyScheduler::new(
                Arc::clone(&self.executor),
                self.store.clone(),
                self.max_parallelism,
            )
            .with_progress(self.progress.clone())
            .with_cancellation(self.cancel.clone());
            report.merge(scheduler.run(&plan).await?);

            if !report.cancelled {
                self.enter(RunPhase::Finalize)?;
                let artifacts = self.store.snapshot().await;
                if let Err(err) = finalizer.finalize(&artifacts).await {
                    warn!(error = %err, "finalization failed");
                    finalize_error = Some(err);
                }
            }
        }
        self.enter(RunPhase::Complete)?;

        let status = report.status();
        let artifacts = self.store.snapshot().await;
        let tasks = report
            .states
            .into_iter()
            .map(|(id, state)| {
                let artifact = artifacts.get(&id).cloned();
                (id, TaskOutcome::new(state, artifact))
            })
            .collect();

        let result = RunResult {
            run_id: self.state.run_id(),
            status,
            tasks,
            finalize_error,
            started_at,
            finished_at: Utc::now(),
            phase_history: self.state.phase_history().to_vec(),
            dispatch_stats: self.dispatcher.stats(),
        };
        info!(summary = %result.summary(), "run finished");
        self.progress.emit(ProgressEvent::RunFinished { status });
        Ok(result)
    }

    /// Record every parallel task as not run.
    fn abandon(&self, plan: &ExecutionPlan, report: &mut StageReport) {
        let failed = report
            .states
            .iter()
            .find(|(_, state)| matches!(state, TaskState::Failed { .. }))
            .map(|(id, _)| id.clone());

        for task in plan.tasks() {
            let state = match (&failed, report.cancelled) {
                (_, true) => TaskState::Cancelled,
                (Some(dependency), false) => TaskState::Skipped {
                    dependency: dependency.clone(),
                },
                (None, false) => TaskState::Cancelled,
            };
            self.progress.task_state(&task.id, &state);
            report.states.insert(task.id.clone(), state);
        }
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("run_id", &self.state.run_id())
            .field("phase", &self.state.current_phase())
            .field("max_parallelism", &self.max_parallelism)
            .finish_non_exhaustive()
    }
}
