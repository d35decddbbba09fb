//! End-to-end runs through the workflow orchestrator.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use docflow::core::{Artifact, TaskId, TaskState};
use docflow::error::{Error, PlanError};
use docflow::orchestration::{CapabilityRegistry, Finalizer, NoopFinalizer, ProgressEvent, ProgressSink, WorkflowOrchestrator};
use docflow::workflow::{RunPhase, RunStatus};

use crate::fixtures::{fast_config, reader, task, StubGenerator, StubScorer};

/// Finalizer that records what it was handed.
#[derive(Default)]
struct RecordingFinalizer {
    seen: Mutex<Vec<TaskId>>,
    fail_with: Option<String>,
}

#[async_trait]
impl Finalizer for RecordingFinalizer {
    async fn finalize(&self, artifacts: &BTreeMap<TaskId, Artifact>) -> Result<(), String> {
        *self.seen.lock().unwrap() = artifacts.keys().cloned().collect();
        match &self.fail_with {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

fn orchestrator(generator: std::sync::Arc<StubGenerator>, scorer: std::sync::Arc<StubScorer>) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(&fast_config(), CapabilityRegistry::with_fallback(generator), scorer).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_full_run_completes_every_task() {
    let generator = StubGenerator::new();
    let scorer = StubScorer::fixed(90.0);
    let finalizer = RecordingFinalizer::default();

    let sequential = vec![task("requirements"), reader("design", "doc").depends_on("requirements")];
    let parallel = vec![
        reader("api", "doc").depends_on("design"),
        reader("tests", "doc").depends_on("api"),
        reader("guide", "doc").depends_on("requirements"),
    ];

    let result = orchestrator(generator.clone(), scorer.clone())
        .run(sequential, parallel, &finalizer)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(result.count("completed"), 5);
    assert_eq!(generator.call_count(), 5);

    // Sequential tasks are always gated; parallel ones have no threshold here.
    assert_eq!(scorer.call_count(), 2);
    assert_eq!(result.artifact(&"design".into()).unwrap().score, Some(90.0));
    assert_eq!(result.artifact(&"api".into()).unwrap().score, None);

    // Dependency artifacts flow into downstream inputs.
    let api = result.artifact(&"api".into()).unwrap();
    assert!(api.content.contains("design<requirements=doc:requirements>"));
    let tests = result.artifact(&"tests".into()).unwrap();
    assert!(tests.content.starts_with("doc:tests<api="));

    let phases: Vec<RunPhase> = result.phase_history.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![RunPhase::Foundation, RunPhase::Parallel, RunPhase::Finalize, RunPhase::Complete]
    );

    let seen = finalizer.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5);
    assert!(result.finalize_error.is_none());
    assert_eq!(result.dispatch_stats.calls, 5);
}

#[tokio::test(start_paused = true)]
async fn test_only_sequential_tasks() {
    let generator = StubGenerator::new();
    let result = orchestrator(generator.clone(), StubScorer::fixed(80.0))
        .run(vec![task("a"), task("b")], Vec::new(), &NoopFinalizer)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(generator.prompts(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_finalize_failure_is_reported_not_fatal() {
    let finalizer = RecordingFinalizer {
        fail_with: Some("cross references broken".into()),
        ..Default::default()
    };
    let result = orchestrator(StubGenerator::new(), StubScorer::fixed(80.0))
        .run(vec![task("a")], vec![task("b").depends_on("a")], &finalizer)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(result.finalize_error.as_deref(), Some("cross references broken"));
    assert!(result.summary().contains("finalize failed: cross references broken"));
}

#[tokio::test(start_paused = true)]
async fn test_plan_errors_raised_before_any_call() {
    let generator = StubGenerator::new();
    let err = orchestrator(generator.clone(), StubScorer::fixed(80.0))
        .run(
            vec![task("a")],
            vec![task("b").depends_on("c"), task("c").depends_on("b")],
            &NoopFinalizer,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Plan(PlanError::Cycle(_))));
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unrouted_kind_rejected() {
    let mut registry = CapabilityRegistry::new();
    registry.register("doc", StubGenerator::new());
    let orchestrator = WorkflowOrchestrator::new(&fast_config(), registry, StubScorer::fixed(80.0)).unwrap();

    let err = orchestrator
        .run(vec![task("a")], vec![reader("b", "diagram")], &NoopFinalizer)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Plan(PlanError::UnroutedKind { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_cover_the_run() {
    let (sink, mut rx) = ProgressSink::channel(256);
    let result = orchestrator(StubGenerator::new(), StubScorer::fixed(80.0))
        .with_progress(sink)
        .run(vec![task("a")], vec![task("b").depends_on("a")], &NoopFinalizer)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(events.contains(&ProgressEvent::TaskStateChanged {
        task_id: "b".into(),
        state: TaskState::Completed,
    }));
    assert!(events.contains(&ProgressEvent::PhaseChanged {
        from: RunPhase::Foundation,
        to: RunPhase::Parallel,
    }));
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::RunFinished {
            status: result.status
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_result_serializes() {
    let result = orchestrator(StubGenerator::new(), StubScorer::fixed(80.0))
        .run(vec![task("a")], Vec::new(), &NoopFinalizer)
        .await
        .unwrap();

    let json = result.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["status"], "complete");
    assert_eq!(value["tasks"]["a"]["state"]["state"], "completed");
}
