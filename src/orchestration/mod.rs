//! Orchestration layer for the docflow engine.
//!
//! Every generation call goes through the [`RateLimitedDispatcher`]. The
//! [`QualityGate`] scores artifacts and drives improvement, the
//! [`SequentialStage`] runs foundational tasks in order, the
//! [`DependencyScheduler`] runs the rest of the plan concurrently, and the
//! [`WorkflowOrchestrator`] sequences the three for one run.

mod capability;
mod dispatcher;
mod executor;
mod orchestrator;
mod progress;
mod quality;
mod scheduler;
mod sequential;
mod store;

pub use capability::{CapabilityRegistry, Generator, Score, ScoreContext, Scorer};
pub use dispatcher::{
    CacheKey, DispatchStats, Dispatched, DispatcherConfig, RateLimitedDispatcher, RetryPolicy,
    TimeoutPolicy, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_CALLS, DEFAULT_SAFETY_MARGIN,
    DEFAULT_WINDOW_SECS,
};
pub use executor::TaskExecutor;
pub use orchestrator::{Finalizer, NoopFinalizer, WorkflowOrchestrator};
pub use progress::{ProgressEvent, ProgressSink};
pub use quality::{QualityGate, QualityPolicy, MAX_IMPROVEMENT_ROUNDS};
pub use scheduler::{DependencyScheduler, DEFAULT_MAX_PARALLELISM};
pub use sequential::SequentialStage;
pub use store::ResultStore;
