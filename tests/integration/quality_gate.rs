//! Scoring and improvement through a full run.

use std::sync::Arc;

use docflow::config::Config;
use docflow::core::{QualityFlag, TaskId, TaskState};
use docflow::orchestration::{CapabilityRegistry, NoopFinalizer, WorkflowOrchestrator};
use docflow::workflow::{RunResult, RunStatus};

use crate::fixtures::{fast_config, reader, task, StubGenerator, StubScorer};

async fn run(
    config: &Config,
    generator: Arc<StubGenerator>,
    scorer: Arc<StubScorer>,
    sequential: Vec<docflow::core::Task>,
    parallel: Vec<docflow::core::Task>,
) -> RunResult {
    WorkflowOrchestrator::new(config, CapabilityRegistry::with_fallback(generator), scorer)
        .unwrap()
        .run(sequential, parallel, &NoopFinalizer)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_passing_score_skips_improvement() {
    let generator = StubGenerator::new();
    let scorer = StubScorer::fixed(75.0);
    let result = run(&fast_config(), generator.clone(), scorer.clone(), vec![task("req")], Vec::new()).await;

    assert_eq!(generator.call_count(), 1);
    assert_eq!(scorer.call_count(), 1);

    let artifact = result.artifact(&"req".into()).unwrap();
    assert_eq!(artifact.score, Some(75.0));
    assert_eq!(artifact.attempt_count, 1);
    assert!(artifact.quality.as_ref().unwrap().flags.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_low_score_triggers_one_improvement() {
    let generator = StubGenerator::new();
    let scorer = StubScorer::fixed(40.0);
    let result = run(&fast_config(), generator.clone(), scorer.clone(), vec![task("req")], Vec::new()).await;

    // Original plus one improvement; the improved version is not rescored.
    assert_eq!(generator.call_count(), 2);
    assert_eq!(scorer.call_count(), 1);

    let artifact = result.artifact(&"req".into()).unwrap();
    assert_eq!(artifact.content, "doc:req [improved r1]");
    assert_eq!(artifact.attempt_count, 2);
    assert_eq!(artifact.original_score(), Some(40.0));
    assert!(artifact.is_below_threshold());

    // Downstream tasks still see the accepted artifact.
    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(result.below_threshold(), vec![&TaskId::from("req")]);
    assert_eq!(result.tasks[&TaskId::from("req")].score, Some(40.0));
}

#[tokio::test(start_paused = true)]
async fn test_improvement_carries_scorer_diagnostics() {
    let generator = StubGenerator::new();
    run(&fast_config(), generator.clone(), StubScorer::fixed(30.0), vec![task("req")], Vec::new()).await;

    let calls = generator.calls();
    let improvement = calls[1].input.improvement.clone().unwrap();
    assert_eq!(improvement.previous_output, "doc:req");
    assert_eq!(improvement.score, 30.0);
    assert_eq!(improvement.threshold, 70.0);
    assert_eq!(
        improvement.diagnostics,
        serde_json::json!({"task": "req", "coverage": 0.3, "missing": ["examples"]})
    );
    // The improvement reuses the original prompt.
    assert_eq!(calls[1].input.prompt, "req");
}

#[tokio::test(start_paused = true)]
async fn test_task_threshold_overrides_default() {
    let generator = StubGenerator::new();
    let result = run(
        &fast_config(),
        generator.clone(),
        StubScorer::fixed(75.0),
        vec![task("req").with_quality_threshold(90.0)],
        Vec::new(),
    )
    .await;

    assert_eq!(generator.call_count(), 2);
    assert!(result.artifact(&"req".into()).unwrap().is_below_threshold());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_tasks_gated_by_kind_threshold() {
    let mut config = fast_config();
    config.quality.thresholds.insert("api".into(), 80.0);
    let generator = StubGenerator::new();
    let scorer = StubScorer::per_kind(60.0, &[("doc", 95.0)]);

    let result = run(
        &config,
        generator.clone(),
        scorer.clone(),
        vec![task("req")],
        vec![reader("api", "api").depends_on("req"), reader("notes", "notes").depends_on("req")],
    )
    .await;

    // req (sequential) and api (kind threshold) are scored; notes is not.
    assert_eq!(scorer.call_count(), 2);
    assert!(result.artifact(&"api".into()).unwrap().is_below_threshold());
    assert!(result.artifact(&"notes".into()).unwrap().quality.is_none());
    assert_eq!(result.artifact(&"req".into()).unwrap().score, Some(95.0));
}

#[tokio::test(start_paused = true)]
async fn test_rescoring_runs_bounded_rounds() {
    let mut config = fast_config();
    config.quality.rescore_improved = true;
    config.quality.max_improvement_rounds = 10;
    let generator = StubGenerator::new();
    let scorer = StubScorer::fixed(50.0);

    let result = run(&config, generator.clone(), scorer.clone(), vec![task("req")], Vec::new()).await;

    // Rounds are capped at three no matter what the config asks for.
    assert_eq!(generator.call_count(), 4);
    assert_eq!(scorer.call_count(), 4);

    let artifact = result.artifact(&"req".into()).unwrap();
    let quality = artifact.quality.as_ref().unwrap();
    assert_eq!(quality.improvement_rounds, 3);
    assert_eq!(quality.flags, vec![QualityFlag::BelowThreshold]);
    // No version beat the original, so the original is kept.
    assert_eq!(artifact.content, "doc:req");
    assert_eq!(artifact.score, Some(50.0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_improvement_keeps_original() {
    let generator = StubGenerator::new();
    generator.reject_improvements();
    let result = run(&fast_config(), generator.clone(), StubScorer::fixed(20.0), vec![task("req")], Vec::new()).await;

    assert_eq!(result.state(&"req".into()), Some(&TaskState::Completed));
    let artifact = result.artifact(&"req".into()).unwrap();
    assert_eq!(artifact.content, "doc:req");
    assert!(artifact.improvement_failed());
    assert!(artifact.is_below_threshold());
    assert_eq!(artifact.attempt_count, 1);
}
