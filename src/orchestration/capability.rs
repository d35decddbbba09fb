//! Capability ports: the generation backend and the scorer.
//!
//! The engine never talks to a backend directly. Generators are registered
//! per task kind in a [`CapabilityRegistry`] before the plan is built, so an
//! unroutable kind is a plan error instead of a runtime surprise.

use crate::core::task::{Artifact, Task, TaskInput, TaskKind};
use crate::error::{GenerationError, PlanError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce output for `input` using the routine selected by `kind`.
    ///
    /// Implementations must report retryable failures as transient
    /// [`GenerationError`] variants.
    async fn invoke(&self, kind: &TaskKind, input: &TaskInput) -> Result<String, GenerationError>;
}

/// Quality score returned by a [`Scorer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Numeric score, conventionally 0-100.
    pub value: f64,
    /// Opaque sub-metric breakdown.
    pub diagnostics: serde_json::Value,
}

impl Score {
    pub fn new(value: f64, diagnostics: serde_json::Value) -> Self {
        Self { value, diagnostics }
    }
}

/// Context given to the scorer alongside the artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreContext {
    pub kind: TaskKind,
    pub threshold: f64,
}

/// Quality scoring backend.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, artifact: &Artifact, context: &ScoreContext) -> Result<Score, GenerationError>;
}

/// Routing table from task kind to generator.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    routes: HashMap<TaskKind, Arc<dyn Generator>>,
    fallback: Option<Arc<dyn Generator>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that routes every kind to one generator.
    pub fn with_fallback(generator: Arc<dyn Generator>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Some(generator),
        }
    }

    /// Route `kind` to `generator`, replacing any earlier route.
    pub fn register(&mut self, kind: impl Into<TaskKind>, generator: Arc<dyn Generator>) -> &mut Self {
        self.routes.insert(kind.into(), generator);
        self
    }

    pub fn resolve(&self, kind: &TaskKind) -> Option<Arc<dyn Generator>> {
        self.routes
            .get(kind)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn is_routed(&self, kind: &TaskKind) -> bool {
        self.routes.contains_key(kind) || self.fallback.is_some()
    }

    /// Check every task's kind resolves.
    pub fn ensure_routes<'a, I>(&self, tasks: I) -> Result<(), PlanError>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        for task in tasks {
            if !self.is_routed(&task.kind) {
                return Err(PlanError::UnroutedKind {
                    task: task.id.clone(),
                    kind: task.kind.clone(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.routes.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
