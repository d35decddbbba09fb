//! Rate-limited dispatcher for generation calls.
//!
//! Every outbound call goes through [`RateLimitedDispatcher::dispatch`]. The
//! dispatcher owns three pieces of shared state behind one lock:
//!
//! - a sliding window of recent calls, bounding the call rate,
//! - an insertion-ordered response cache, so identical requests in a run
//!   reach the backend once,
//! - an in-flight table, so a request identical to one already running waits
//!   for that call's outcome instead of issuing its own.
//!
//! Transient failures are retried with exponential backoff; permanent ones
//! surface immediately.

use crate::config::Config;
use crate::core::task::{TaskInput, TaskKind};
use crate::error::{DispatchError, GenerationError};
use crate::orchestration::capability::{CapabilityRegistry, Generator};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default maximum calls per window.
pub const DEFAULT_MAX_CALLS: u32 = 50;

/// Default rate window length.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default fraction of the nominal limit actually used.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.95;

/// Default number of cached responses.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier applied per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-indexed).
    ///
    /// `base_delay * multiplier^(retry - 1)`; with base 1s and multiplier 2.0
    /// that is 1s, 2s, 4s, ...
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Per-call deadline policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    /// Hard upper bound for any single call.
    pub ceiling: Duration,
    /// Fixed allowance when the expected output size is known.
    pub base: Duration,
    /// Extra allowance per 1000 expected output tokens.
    pub per_1k_tokens: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(300),
            base: Duration::from_secs(30),
            per_1k_tokens: Duration::from_secs(20),
        }
    }
}

impl TimeoutPolicy {
    /// Deadline for one call carrying `input`.
    pub fn deadline_for(&self, input: &TaskInput) -> Duration {
        match input.expected_output_tokens {
            Some(tokens) => {
                let sized = self.base + self.per_1k_tokens.mul_f64(f64::from(tokens) / 1000.0);
                sized.min(self.ceiling)
            }
            None => self.ceiling,
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Nominal maximum calls per window.
    pub max_calls: u32,
    /// Length of the sliding window.
    pub window: Duration,
    /// Fraction of `max_calls` actually used, in (0, 1].
    pub safety_margin: f64,
    /// Cached responses kept; 0 disables caching.
    pub cache_capacity: usize,
    pub retry: RetryPolicy,
    pub timeout: TimeoutPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_calls: DEFAULT_MAX_CALLS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            retry: RetryPolicy::default(),
            timeout: TimeoutPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Calls admitted per window: `floor(max_calls * safety_margin)`, at least 1.
    pub fn effective_limit(&self) -> usize {
        let limit = (f64::from(self.max_calls) * self.safety_margin).floor() as usize;
        limit.max(1)
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_calls: config.rate_limit.max_calls,
            window: Duration::from_secs(config.rate_limit.window_secs),
            safety_margin: config.rate_limit.safety_margin,
            cache_capacity: config.cache_capacity,
            retry: RetryPolicy {
                max_retries: config.retry.max_retries,
                base_delay: Duration::from_millis(config.retry.base_delay_ms),
                multiplier: config.retry.multiplier,
            },
            timeout: TimeoutPolicy {
                ceiling: Duration::from_secs(config.timeout.ceiling_secs),
                base: Duration::from_secs(config.timeout.base_secs),
                per_1k_tokens: Duration::from_secs(config.timeout.per_1k_tokens_secs),
            },
        }
    }
}

/// Deterministic key for a `(capability, input)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &TaskKind, input: &TaskInput) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0]);
        // TaskInput only holds strings, numbers and JSON values, so this
        // serialization cannot fail; fall back to the prompt to stay total.
        match serde_json::to_vec(input) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(input.prompt.as_bytes()),
        };
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Output of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub output: String,
    /// Backend calls made for this request; 0 when served from cache.
    pub attempts: u32,
    /// Served from cache or from an identical in-flight call.
    pub cached: bool,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Every dispatch request, hit or miss.
    pub requests: u64,
    /// Requests answered from the response cache.
    pub cache_hits: u64,
    /// Requests that waited on an identical in-flight call.
    pub coalesced: u64,
    /// Backend calls issued, retries included.
    pub calls: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Requests that ended in a terminal error.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    calls: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// One issued backend call in the rate window.
#[derive(Debug)]
struct DispatcherSlot {
    id: u64,
    issued_at: Instant,
    completed_at: Option<Instant>,
    cache_key: CacheKey,
}

impl DispatcherSlot {
    /// Completion time once finished, issue time while running. Running
    /// slots never age out of the window, so only finished stamps expire.
    fn stamp(&self) -> Instant {
        self.completed_at.unwrap_or(self.issued_at)
    }

    fn is_running(&self) -> bool {
        self.completed_at.is_none()
    }
}

type SharedOutcome = Option<Result<String, DispatchError>>;

#[derive(Default)]
struct DispatchState {
    window: Vec<DispatcherSlot>,
    next_slot: u64,
    cache: HashMap<CacheKey, String>,
    cache_order: VecDeque<CacheKey>,
    in_flight: HashMap<CacheKey, watch::Sender<SharedOutcome>>,
}

impl DispatchState {
    /// Drop completed slots older than `window`. Running slots always stay.
    fn prune(&mut self, now: Instant, window: Duration) {
        self.window
            .retain(|slot| slot.is_running() || now.saturating_duration_since(slot.stamp()) < window);
    }

    fn remember(&mut self, key: CacheKey, output: String, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.cache.insert(key.clone(), output).is_none() {
            self.cache_order.push_back(key);
        }
        while self.cache_order.len() > capacity {
            if let Some(evicted) = self.cache_order.pop_front() {
                self.cache.remove(&evicted);
            }
        }
    }
}

enum Lookup {
    Hit(String),
    Wait(watch::Receiver<SharedOutcome>),
    Lead,
}

/// Single choke point for generation calls.
///
/// # Example
///
/// ```ignore
/// let registry = CapabilityRegistry::with_fallback(Arc::new(backend));
/// let dispatcher = RateLimitedDispatcher::new(DispatcherConfig::default(), registry);
/// let out = dispatcher.dispatch(&"design".into(), &TaskInput::new("...")).await?;
/// ```
pub struct RateLimitedDispatcher {
    config: DispatcherConfig,
    registry: CapabilityRegistry,
    state: Mutex<DispatchState>,
    slot_released: Notify,
    counters: Counters,
}

impl RateLimitedDispatcher {
    pub fn new(config: DispatcherConfig, registry: CapabilityRegistry) -> Self {
        Self {
            config,
            registry,
            state: Mutex::new(DispatchState::default()),
            slot_released: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Current counter values.
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Number of cached responses.
    pub fn cached_entries(&self) -> usize {
        self.lock_state().cache.len()
    }

    /// Calls currently counted against the rate window.
    pub fn calls_in_window(&self) -> usize {
        let mut state = self.lock_state();
        state.prune(Instant::now(), self.config.window);
        state.window.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch one request to the generator routed for `kind`.
    ///
    /// The caller is suspended until the rate window has room. Cache hits and
    /// coalesced requests never consume a window slot.
    ///
    /// # Errors
    ///
    /// - `UnknownCapability` if no generator is routed for `kind`
    /// - `Permanent` on the first non-retryable backend error
    /// - `RetriesExhausted` once transient failures use up the retry budget
    pub async fn dispatch(&self, kind: &TaskKind, input: &TaskInput) -> Result<Dispatched, DispatchError> {
        Counters::bump(&self.counters.requests);

        let generator = match self.registry.resolve(kind) {
            Some(generator) => generator,
            None => {
                Counters::bump(&self.counters.failures);
                return Err(DispatchError::UnknownCapability(kind.clone()));
            }
        };
        let key = CacheKey::new(kind, input);

        let lookup = {
            let mut state = self.lock_state();
            if let Some(output) = state.cache.get(&key) {
                Lookup::Hit(output.clone())
            } else if let Some(tx) = state.in_flight.get(&key) {
                Lookup::Wait(tx.subscribe())
            } else {
                let (tx, _rx) = watch::channel(None);
                state.in_flight.insert(key.clone(), tx);
                Lookup::Lead
            }
        };

        match lookup {
            Lookup::Hit(output) => {
                Counters::bump(&self.counters.cache_hits);
                debug!(kind = %kind, key = key.as_str(), "dispatch cache hit");
                Ok(Dispatched {
                    output,
                    attempts: 0,
                    cached: true,
                })
            }
            Lookup::Wait(rx) => self.await_in_flight(kind, &key, rx).await,
            Lookup::Lead => {
                let mut guard = InFlightGuard {
                    dispatcher: self,
                    key: &key,
                    armed: true,
                };
                let result = self.call_with_retry(generator, kind, input, &key).await;
                self.finish_in_flight(&key, &result);
                guard.armed = false;
                result
            }
        }
    }

    async fn await_in_flight(
        &self,
        kind: &TaskKind,
        key: &CacheKey,
        mut rx: watch::Receiver<SharedOutcome>,
    ) -> Result<Dispatched, DispatchError> {
        debug!(kind = %kind, key = key.as_str(), "waiting on identical in-flight request");
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(output)) => {
                Counters::bump(&self.counters.coalesced);
                Ok(Dispatched {
                    output,
                    attempts: 0,
                    cached: true,
                })
            }
            Some(Err(err)) => {
                Counters::bump(&self.counters.failures);
                Err(err)
            }
            None => {
                Counters::bump(&self.counters.failures);
                Err(DispatchError::Interrupted)
            }
        }
    }

    fn finish_in_flight(&self, key: &CacheKey, result: &Result<Dispatched, DispatchError>) {
        let mut state = self.lock_state();
        if let Ok(dispatched) = result {
            state.remember(key.clone(), dispatched.output.clone(), self.config.cache_capacity);
        }
        if let Some(tx) = state.in_flight.remove(key) {
            let shared = result.as_ref().map(|d| d.output.clone()).map_err(Clone::clone);
            tx.send_replace(Some(shared));
        }
    }

    async fn call_with_retry(
        &self,
        generator: Arc<dyn Generator>,
        kind: &TaskKind,
        input: &TaskInput,
        key: &CacheKey,
    ) -> Result<Dispatched, DispatchError> {
        let deadline = self.config.timeout.deadline_for(input);
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let lease = SlotLease {
                dispatcher: self,
                id: self.acquire_slot(key).await,
            };
            Counters::bump(&self.counters.calls);
            debug!(kind = %kind, attempt, deadline_ms = deadline.as_millis() as u64, "dispatching call");

            let outcome = match tokio::time::timeout(deadline, generator.invoke(kind, input)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GenerationError::Timeout(deadline)),
            };
            drop(lease);

            let err = match outcome {
                Ok(output) => {
                    return Ok(Dispatched {
                        output,
                        attempts: attempt,
                        cached: false,
                    })
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                Counters::bump(&self.counters.failures);
                warn!(kind = %kind, error = %err, "permanent dispatch failure");
                return Err(DispatchError::Permanent(err));
            }
            if attempt > retry.max_retries {
                Counters::bump(&self.counters.failures);
                warn!(kind = %kind, attempts = attempt, error = %err, "retries exhausted");
                return Err(DispatchError::RetriesExhausted { attempts: attempt, last: err });
            }

            let mut delay = retry.next_delay(attempt);
            if let GenerationError::RateLimited {
                retry_after: Some(after),
            } = &err
            {
                delay = delay.max(*after);
            }
            Counters::bump(&self.counters.retries);
            warn!(
                kind = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for room in the rate window and reserve a slot.
    async fn acquire_slot(&self, key: &CacheKey) -> u64 {
        let limit = self.config.effective_limit();
        let window = self.config.window;
        loop {
            // Registered before the check so a release between unlock and
            // await still wakes this waiter.
            let released = self.slot_released.notified();
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();
                state.prune(now, window);
                if state.window.len() < limit {
                    let id = state.next_slot;
                    state.next_slot += 1;
                    state.window.push(DispatcherSlot {
                        id,
                        issued_at: now,
                        completed_at: None,
                        cache_key: key.clone(),
                    });
                    return id;
                }
                state
                    .window
                    .iter()
                    .filter(|slot| !slot.is_running())
                    .map(DispatcherSlot::stamp)
                    .min()
                    .map(|oldest| (oldest + window).saturating_duration_since(now))
            };
            match wait {
                Some(wait) => {
                    debug!(
                        key = key.as_str(),
                        wait_ms = wait.as_millis() as u64,
                        "rate window full, waiting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
                        _ = released => {}
                    }
                }
                None => {
                    debug!(key = key.as_str(), "all slots running, waiting for a completion");
                    released.await;
                }
            }
        }
    }

    /// Record the completion time of a reserved slot.
    fn release_slot(&self, id: u64) {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let Some(slot) = state.window.iter_mut().find(|slot| slot.id == id) {
            slot.completed_at = Some(now);
            debug!(
                key = slot.cache_key.as_str(),
                elapsed_ms = now.saturating_duration_since(slot.issued_at).as_millis() as u64,
                "call completed"
            );
        }
        drop(state);
        self.slot_released.notify_waiters();
    }
}

impl std::fmt::Debug for RateLimitedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedDispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Clears an in-flight entry if the leading request is dropped mid-call, so
/// waiters observe `Interrupted` instead of hanging.
struct InFlightGuard<'a> {
    dispatcher: &'a RateLimitedDispatcher,
    key: &'a CacheKey,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.lock_state().in_flight.remove(self.key);
        }
    }
}

/// A reserved window slot. Dropping it records completion, including when
/// the call future is cancelled mid-flight.
struct SlotLease<'a> {
    dispatcher: &'a RateLimitedDispatcher,
    id: u64,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.dispatcher.release_slot(self.id);
    }
}
