//! Integration test suite for docflow.
//!
//! These tests drive the public API end to end with stub generation and
//! scoring backends.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full runs through the orchestrator
//! - `parallel_tasks`: Dependency scheduling and concurrency bounds
//! - `rate_limit`: Sliding window, cache and coalescing under load
//! - `quality_gate`: Scoring and improvement through a full run
//! - `recovery`: Failure propagation, retries and cancellation
//!
//! # CI Compatibility
//!
//! Timing-sensitive tests run on tokio's paused clock, so they are
//! deterministic and make no network calls.

mod fixtures;

mod workflow_e2e;
mod parallel_tasks;
mod rate_limit;
mod quality_gate;
