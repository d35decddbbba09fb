//! Dependency scheduling and concurrency bounds.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use docflow::core::{Artifact, TaskId, TaskState};
use docflow::orchestration::{CapabilityRegistry, DependencyScheduler, NoopFinalizer, ResultStore, TaskExecutor, WorkflowOrchestrator};
use docflow::workflow::RunStatus;

use crate::fixtures::{dispatcher, dispatcher_config, fast_config, reader, task, StubGenerator, StubScorer};

fn scheduler(generator: Arc<StubGenerator>, store: ResultStore, parallelism: usize) -> DependencyScheduler {
    let dispatcher = dispatcher(dispatcher_config(1000, Duration::from_secs(1)), generator);
    DependencyScheduler::new(Arc::new(TaskExecutor::new(dispatcher)), store, parallelism)
}

#[tokio::test(start_paused = true)]
async fn test_independent_tasks_respect_parallelism() {
    let generator = StubGenerator::with_latency(Duration::from_secs(1));
    let mut config = fast_config();
    config.max_parallelism = 2;
    let orchestrator = WorkflowOrchestrator::new(
        &config,
        CapabilityRegistry::with_fallback(generator.clone()),
        StubScorer::fixed(90.0),
    )
    .unwrap();

    let start = Instant::now();
    let result = orchestrator
        .run(Vec::new(), vec![task("a"), task("b"), task("c")], &NoopFinalizer)
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(generator.peak_concurrency(), 2);
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_diamond_waits_for_both_parents() {
    let generator = StubGenerator::with_latency(Duration::from_secs(1));
    let store = ResultStore::new();
    let report = scheduler(generator.clone(), store.clone(), 4)
        .run_tasks(vec![
            task("root"),
            reader("left", "doc").depends_on("root"),
            reader("right", "doc").depends_on("root"),
            reader("join", "doc").depends_on("left").depends_on("right"),
        ])
        .await
        .unwrap();

    assert_eq!(report.count("completed"), 4);

    let calls = generator.calls();
    let started = |prefix: &str| {
        calls
            .iter()
            .find(|c| c.input.prompt.starts_with(prefix))
            .map(|c| c.started_at)
            .unwrap()
    };
    assert!(started("left") >= started("root") + Duration::from_secs(1));
    assert!(started("join") >= started("left") + Duration::from_secs(1));
    assert!(started("join") >= started("right") + Duration::from_secs(1));
    // Siblings run side by side.
    assert_eq!(started("left"), started("right"));

    let join = store.get(&"join".into()).await.unwrap();
    assert!(join.content.contains("left=doc:left<root=doc:root>"));
    assert!(join.content.contains("right=doc:right<root=doc:root>"));
}

#[tokio::test(start_paused = true)]
async fn test_dependencies_satisfied_by_store() {
    let generator = StubGenerator::new();
    let store = ResultStore::new();
    store
        .insert("brief".into(), Artifact::new("brief".into(), "BRIEF"))
        .await
        .unwrap();

    let report = scheduler(generator.clone(), store.clone(), 2)
        .run_tasks(vec![reader("outline", "doc").depends_on("brief")])
        .await
        .unwrap();

    assert_eq!(report.states.get(&TaskId::from("outline")), Some(&TaskState::Completed));
    assert_eq!(generator.prompts(), vec!["outline<brief=BRIEF>".to_string()]);
    // Only the scheduled task is reported.
    assert_eq!(report.states.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_runs_in_declaration_order() {
    let generator = StubGenerator::new();
    scheduler(generator.clone(), ResultStore::new(), 1)
        .run_tasks(vec![task("x"), task("y"), task("z")])
        .await
        .unwrap();

    assert_eq!(generator.peak_concurrency(), 1);
    assert_eq!(
        generator.prompts(),
        vec!["x".to_string(), "y".to_string(), "z".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_wide_fan_out_bounded() {
    let generator = StubGenerator::with_latency(Duration::from_millis(500));
    let mut tasks = vec![task("root")];
    let ids: Vec<&'static str> = vec!["c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9"];
    for id in &ids {
        tasks.push(task(id).depends_on("root"));
    }

    let report = scheduler(generator.clone(), ResultStore::new(), 3)
        .run_tasks(tasks)
        .await
        .unwrap();

    assert_eq!(report.count("completed"), 11);
    assert_eq!(generator.peak_concurrency(), 3);
}
