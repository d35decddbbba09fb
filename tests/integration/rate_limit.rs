//! Sliding window, cache and coalescing under load.

use futures::future::join_all;
use std::time::Duration;
use tokio::time::Instant;

use docflow::core::{TaskInput, TaskKind};
use docflow::error::GenerationError;

use crate::fixtures::{dispatcher, dispatcher_config, StubGenerator};

#[tokio::test(start_paused = true)]
async fn test_window_spreads_calls() {
    let generator = StubGenerator::new();
    let dispatcher = dispatcher(dispatcher_config(2, Duration::from_secs(1)), generator.clone());
    let kind = TaskKind::from("doc");

    let start = Instant::now();
    let inputs: Vec<TaskInput> = (0..5).map(|i| TaskInput::new(format!("req-{}", i))).collect();
    let results = join_all(inputs.iter().map(|input| dispatcher.dispatch(&kind, input))).await;
    let elapsed = start.elapsed();

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(generator.call_count(), 5);
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);

    // No more than two calls start inside any one-second window.
    let mut starts: Vec<Instant> = generator.calls().iter().map(|c| c.started_at).collect();
    starts.sort();
    for pair in starts.windows(3) {
        assert!(pair[2].duration_since(pair[0]) >= Duration::from_secs(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_safety_margin_lowers_limit() {
    let generator = StubGenerator::new();
    let mut config = dispatcher_config(10, Duration::from_secs(1));
    config.safety_margin = 0.5;
    let dispatcher = dispatcher(config, generator.clone());
    let kind = TaskKind::from("doc");

    let start = Instant::now();
    let inputs: Vec<TaskInput> = (0..6).map(|i| TaskInput::new(format!("req-{}", i))).collect();
    join_all(inputs.iter().map(|input| dispatcher.dispatch(&kind, input))).await;

    // Five calls fit in the first window; the sixth waits for the next.
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(dispatcher.stats().calls, 6);
}

#[tokio::test(start_paused = true)]
async fn test_identical_requests_hit_cache() {
    let generator = StubGenerator::new();
    let dispatcher = dispatcher(dispatcher_config(10, Duration::from_secs(1)), generator.clone());
    let kind = TaskKind::from("doc");
    let input = TaskInput::new("same");

    let first = dispatcher.dispatch(&kind, &input).await.unwrap();
    let second = dispatcher.dispatch(&kind, &input).await.unwrap();

    assert_eq!(generator.call_count(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.output, second.output);

    let stats = dispatcher.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_key_includes_kind() {
    let generator = StubGenerator::new();
    let dispatcher = dispatcher(dispatcher_config(10, Duration::from_secs(1)), generator.clone());
    let input = TaskInput::new("same");

    let doc = dispatcher.dispatch(&"doc".into(), &input).await.unwrap();
    let api = dispatcher.dispatch(&"api".into(), &input).await.unwrap();

    assert_eq!(generator.call_count(), 2);
    assert_ne!(doc.output, api.output);
}

#[tokio::test(start_paused = true)]
async fn test_cache_hits_do_not_wait_for_window() {
    let generator = StubGenerator::new();
    let dispatcher = dispatcher(dispatcher_config(1, Duration::from_secs(10)), generator.clone());
    let kind = TaskKind::from("doc");
    let input = TaskInput::new("once");

    dispatcher.dispatch(&kind, &input).await.unwrap();
    let start = Instant::now();
    for _ in 0..3 {
        dispatcher.dispatch(&kind, &input).await.unwrap();
    }

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(dispatcher.calls_in_window(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_requests_coalesce() {
    let generator = StubGenerator::with_latency(Duration::from_secs(1));
    let dispatcher = dispatcher(dispatcher_config(10, Duration::from_secs(1)), generator.clone());
    let kind = TaskKind::from("doc");
    let input = TaskInput::new("popular");

    let results = join_all((0..4).map(|_| dispatcher.dispatch(&kind, &input))).await;

    assert_eq!(generator.call_count(), 1);
    let outputs: Vec<String> = results.into_iter().map(|r| r.unwrap().output).collect();
    assert!(outputs.iter().all(|o| o == "doc:popular"));
    assert_eq!(dispatcher.stats().coalesced, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_honoured() {
    let generator = StubGenerator::new();
    generator.script(
        "busy",
        vec![GenerationError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        }],
    );
    let dispatcher = dispatcher(dispatcher_config(10, Duration::from_secs(1)), generator.clone());

    let dispatched = dispatcher
        .dispatch(&"doc".into(), &TaskInput::new("busy"))
        .await
        .unwrap();

    assert_eq!(dispatched.attempts, 2);
    let calls = generator.calls();
    assert!(calls[1].started_at.duration_since(calls[0].started_at) >= Duration::from_secs(5));
}
