//! Quality gate: score an artifact and drive a bounded improvement pass.
//!
//! `Generated(v1) -> Scored -> {Accepted | ImprovementRequested}`, then
//! `Improved(v2) -> Accepted`. A quality miss never fails a task; the best
//! available artifact is accepted and annotated.

use crate::config::QualityConfig;
use crate::core::task::{
    Artifact, ImprovementContext, QualityFlag, QualityReport, Task, TaskInput, TaskKind,
};
use crate::error::{DispatchError, GenerationError};
use crate::orchestration::capability::{Score, ScoreContext, Scorer};
use crate::orchestration::dispatcher::RateLimitedDispatcher;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hard cap on improvement rounds, whatever the configuration says.
pub const MAX_IMPROVEMENT_ROUNDS: u32 = 3;

/// How the gate picks thresholds and how hard it tries to improve.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityPolicy {
    /// Threshold for sequential tasks without their own or a per-kind one.
    pub default_threshold: f64,
    /// Per-kind thresholds.
    pub thresholds: HashMap<TaskKind, f64>,
    /// Improvement calls allowed per task, capped at [`MAX_IMPROVEMENT_ROUNDS`].
    pub max_improvement_rounds: u32,
    /// Score improved versions and keep the best one.
    pub rescore_improved: bool,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            default_threshold: 70.0,
            thresholds: HashMap::new(),
            max_improvement_rounds: 1,
            rescore_improved: false,
        }
    }
}

impl From<&QualityConfig> for QualityPolicy {
    fn from(config: &QualityConfig) -> Self {
        Self {
            default_threshold: config.default_threshold,
            thresholds: config
                .thresholds
                .iter()
                .map(|(kind, threshold)| (TaskKind::from(kind.as_str()), *threshold))
                .collect(),
            max_improvement_rounds: config.max_improvement_rounds,
            rescore_improved: config.rescore_improved,
        }
    }
}

impl QualityPolicy {
    /// Effective round budget.
    pub fn rounds(&self) -> u32 {
        self.max_improvement_rounds.min(MAX_IMPROVEMENT_ROUNDS)
    }

    /// Threshold for a task that must be gated: the task's own, then the
    /// per-kind one, then the default.
    pub fn required_threshold(&self, task: &Task) -> f64 {
        self.optional_threshold(task)
            .unwrap_or(self.default_threshold)
    }

    /// Threshold for a task gated only when one is configured.
    pub fn optional_threshold(&self, task: &Task) -> Option<f64> {
        task.quality_threshold
            .or_else(|| self.thresholds.get(&task.kind).copied())
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    content: String,
    score: Option<f64>,
}

/// Scores artifacts and issues improvement calls through the dispatcher.
pub struct QualityGate {
    dispatcher: Arc<RateLimitedDispatcher>,
    scorer: Arc<dyn Scorer>,
    policy: QualityPolicy,
}

impl QualityGate {
    pub fn new(dispatcher: Arc<RateLimitedDispatcher>, scorer: Arc<dyn Scorer>, policy: QualityPolicy) -> Self {
        Self {
            dispatcher,
            scorer,
            policy,
        }
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    /// Score `artifact` against `threshold`.
    pub async fn evaluate(
        &self,
        artifact: &Artifact,
        kind: &TaskKind,
        threshold: f64,
    ) -> Result<Score, GenerationError> {
        let context = ScoreContext {
            kind: kind.clone(),
            threshold,
        };
        self.scorer.score(artifact, &context).await
    }

    /// Request an improved version of `original`.
    ///
    /// The scorer's diagnostic bundle is forwarded verbatim in
    /// [`TaskInput::improvement`].
    pub async fn improve(
        &self,
        original: &Artifact,
        input: &TaskInput,
        kind: &TaskKind,
        score: &Score,
        threshold: f64,
        round: u32,
    ) -> Result<Artifact, DispatchError> {
        let request = input.for_improvement(ImprovementContext {
            previous_output: original.content.clone(),
            score: score.value,
            threshold,
            diagnostics: score.diagnostics.clone(),
            round,
        });
        let dispatched = self.dispatcher.dispatch(kind, &request).await?;

        let mut improved = Artifact::new(original.source_task_id.clone(), dispatched.output);
        improved.attempt_count = original.attempt_count + 1;
        Ok(improved)
    }

    /// Run `artifact` through the gate and return the accepted version.
    ///
    /// `input` is the request that produced `artifact`; improvement calls
    /// are derived from it.
    pub async fn gate(&self, artifact: Artifact, input: &TaskInput, kind: &TaskKind, threshold: f64) -> Artifact {
        let task_id = artifact.source_task_id.clone();

        let first = match self.evaluate(&artifact, kind, threshold).await {
            Ok(score) => score,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "scoring failed, accepting unscored artifact");
                let mut accepted = artifact;
                accepted.quality = Some(QualityReport {
                    threshold,
                    original_score: None,
                    final_score: None,
                    improvement_rounds: 0,
                    diagnostics: serde_json::Value::Null,
                    flags: vec![QualityFlag::ScoringFailed {
                        reason: err.to_string(),
                    }],
                });
                return accepted;
            }
        };

        if first.value >= threshold {
            debug!(task_id = %task_id, score = first.value, threshold, "artifact accepted");
            let mut accepted = artifact;
            accepted.score = Some(first.value);
            accepted.quality = Some(QualityReport {
                threshold,
                original_score: Some(first.value),
                final_score: Some(first.value),
                improvement_rounds: 0,
                diagnostics: first.diagnostics,
                flags: Vec::new(),
            });
            return accepted;
        }

        info!(
            task_id = %task_id,
            score = first.value,
            threshold,
            "artifact below threshold, requesting improvement"
        );

        let original = Candidate {
            content: artifact.content.clone(),
            score: Some(first.value),
        };
        let mut best = original.clone();
        let mut latest = first.clone();
        let mut latest_artifact = artifact.clone();
        let mut rounds_done = 0u32;
        let mut flags = Vec::new();

        for round in 1..=self.policy.rounds() {
            let improved = match self
                .improve(&latest_artifact, input, kind, &latest, threshold, round)
                .await
            {
                Ok(improved) => improved,
                Err(err) => {
                    warn!(task_id = %task_id, round, error = %err, "improvement failed, keeping previous version");
                    flags.push(QualityFlag::ImprovementFailed {
                        reason: err.to_string(),
                    });
                    break;
                }
            };
            rounds_done += 1;

            if !self.policy.rescore_improved {
                // Without a fresh score there is nothing to steer another round.
                best = Candidate {
                    content: improved.content,
                    score: None,
                };
                break;
            }

            match self.evaluate(&improved, kind, threshold).await {
                Ok(score) => {
                    debug!(task_id = %task_id, round, score = score.value, "improved version scored");
                    let candidate = Candidate {
                        content: improved.content.clone(),
                        score: Some(score.value),
                    };
                    if score.value > best.score.unwrap_or(f64::MIN) {
                        best = candidate;
                    }
                    let passed = score.value >= threshold;
                    latest = score;
                    latest_artifact = improved;
                    if passed {
                        break;
                    }
                }
                Err(err) => {
                    warn!(task_id = %task_id, round, error = %err, "scoring improved version failed");
                    flags.push(QualityFlag::ScoringFailed {
                        reason: err.to_string(),
                    });
                    best = Candidate {
                        content: improved.content,
                        score: None,
                    };
                    break;
                }
            }
        }

        let below = best.score.map_or(true, |score| score < threshold);
        if below {
            flags.insert(0, QualityFlag::BelowThreshold);
            warn!(
                task_id = %task_id,
                original_score = first.value,
                final_score = ?best.score,
                rounds = rounds_done,
                "accepting artifact below threshold"
            );
        }

        let mut accepted = Artifact::new(task_id, best.content);
        accepted.created_at = artifact.created_at;
        accepted.score = best.score;
        accepted.attempt_count = artifact.attempt_count + rounds_done;
        accepted.quality = Some(QualityReport {
            threshold,
            original_score: Some(first.value),
            final_score: best.score,
            improvement_rounds: rounds_done,
            diagnostics: first.diagnostics,
            flags,
        });
        accepted
    }
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
