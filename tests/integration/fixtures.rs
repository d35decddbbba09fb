//! Test fixtures for integration tests.
//!
//! Provides:
//! - A scriptable stub generator with call accounting
//! - A stub scorer with per-kind scores
//! - Helpers for building tasks, dispatchers and configs

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use docflow::config::Config;
use docflow::core::{Artifact, DependencyOutputs, Task, TaskInput, TaskKind};
use docflow::error::GenerationError;
use docflow::orchestration::{
    CapabilityRegistry, DispatcherConfig, Generator, RateLimitedDispatcher, RetryPolicy, Score,
    ScoreContext, Scorer, TimeoutPolicy,
};

/// One recorded backend call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub kind: TaskKind,
    pub input: TaskInput,
    pub started_at: Instant,
}

/// Stub generation backend.
///
/// Echoes `"<kind>:<prompt>"` after `latency`. Prompts starting with
/// `fail` are rejected permanently; scripted failures are returned first
/// for the matching prompt.
#[derive(Default)]
pub struct StubGenerator {
    latency: Duration,
    scripted: Mutex<HashMap<String, VecDeque<GenerationError>>>,
    calls: Mutex<Vec<CallRecord>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    reject_improvements: AtomicBool,
}

impl StubGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    /// Fail calls for `prompt` with `errors`, in order, before succeeding.
    pub fn script(&self, prompt: &str, errors: Vec<GenerationError>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(prompt.to_string(), errors.into());
    }

    /// Reject every improvement request from now on.
    pub fn reject_improvements(&self) {
        self.reject_improvements.store(true, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, prompt: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.input.prompt == prompt)
            .count()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.input.prompt.clone())
            .collect()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn invoke(&self, kind: &TaskKind, input: &TaskInput) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push(CallRecord {
            kind: kind.clone(),
            input: input.clone(),
            started_at: Instant::now(),
        });
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&input.prompt)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        if input.prompt.starts_with("fail") {
            return Err(GenerationError::Rejected(format!("cannot handle {}", input.prompt)));
        }
        match &input.improvement {
            Some(_) if self.reject_improvements.load(Ordering::SeqCst) => {
                Err(GenerationError::Rejected("improvement refused".into()))
            }
            Some(ctx) => Ok(format!("{} [improved r{}]", ctx.previous_output, ctx.round)),
            None => Ok(format!("{}:{}", kind, input.prompt)),
        }
    }
}

/// Stub scorer returning a fixed score per kind.
pub struct StubScorer {
    scores: HashMap<String, f64>,
    default: f64,
    calls: AtomicUsize,
}

impl StubScorer {
    pub fn fixed(default: f64) -> Arc<Self> {
        Arc::new(Self {
            scores: HashMap::new(),
            default,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn per_kind(default: f64, scores: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            default,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for StubScorer {
    async fn score(&self, artifact: &Artifact, context: &ScoreContext) -> Result<Score, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = self
            .scores
            .get(context.kind.as_str())
            .copied()
            .unwrap_or(self.default);
        Ok(Score::new(
            value,
            serde_json::json!({
                "task": artifact.source_task_id.as_str(),
                "coverage": value / 100.0,
                "missing": ["examples"],
            }),
        ))
    }
}

/// Task whose prompt is its own ID.
pub fn task(id: &'static str) -> Task {
    Task::new(id, "doc", move |_: &DependencyOutputs| TaskInput::new(id))
}

/// Task whose prompt lists its dependencies' outputs.
pub fn reader(id: &'static str, kind: &'static str) -> Task {
    Task::new(id, kind, move |deps: &DependencyOutputs| {
        let parts: Vec<String> = deps
            .iter()
            .map(|(dep, artifact)| format!("{}={}", dep, artifact.content))
            .collect();
        TaskInput::new(format!("{}<{}>", id, parts.join(";")))
    })
}

/// Config with a generous rate limit and fast retries.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.max_calls = 1000;
    config.rate_limit.window_secs = 1;
    config.rate_limit.safety_margin = 1.0;
    config.retry.base_delay_ms = 10;
    config
}

pub fn dispatcher_config(max_calls: u32, window: Duration) -> DispatcherConfig {
    DispatcherConfig {
        max_calls,
        window,
        safety_margin: 1.0,
        cache_capacity: 64,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        },
        timeout: TimeoutPolicy::default(),
    }
}

pub fn dispatcher(config: DispatcherConfig, generator: Arc<StubGenerator>) -> Arc<RateLimitedDispatcher> {
    Arc::new(RateLimitedDispatcher::new(
        config,
        CapabilityRegistry::with_fallback(generator),
    ))
}
