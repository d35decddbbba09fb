//! Declarative plan files.
//!
//! A plan file lists sequential and parallel tasks in TOML:
//!
//! ```toml
//! [[sequential]]
//! id = "requirements"
//! kind = "requirements"
//! prompt = "Write requirements for the billing service"
//! threshold = 80.0
//!
//! [[parallel]]
//! id = "api"
//! kind = "api_design"
//! depends_on = ["requirements"]
//! prompt = "Design the API from:\n{{requirements}}"
//! ```
//!
//! `{{id}}` placeholders are replaced with the content of that task's
//! artifact when the input is built.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::plan::{validate_sequence, ExecutionPlan};
use crate::core::task::{DependencyOutputs, Task, TaskId, TaskInput};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecl {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tokens: Option<u32>,
    #[serde(default)]
    pub prompt: String,
}

impl TaskDecl {
    /// Turn the declaration into a task whose input is the rendered prompt.
    pub fn to_task(&self) -> Task {
        let template = self.prompt.clone();
        let expected_tokens = self.expected_tokens;
        let mut task = Task::new(self.id.as_str(), self.kind.as_str(), move |deps: &DependencyOutputs| {
            let input = TaskInput::new(render(&template, deps));
            match expected_tokens {
                Some(tokens) => input.with_expected_tokens(tokens),
                None => input,
            }
        })
        .with_dependencies(self.depends_on.iter().map(String::as_str));
        if let Some(threshold) = self.threshold {
            task = task.with_quality_threshold(threshold);
        }
        task
    }
}

/// Replace `{{id}}` with the content of each dependency artifact.
///
/// Placeholders are expanded in a single pass over the template; inserted
/// content is never scanned again. Unknown placeholders are kept as written.
pub fn render(template: &str, deps: &DependencyOutputs) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &after[..close];
        match deps.get(&TaskId::from(name)) {
            Some(artifact) => out.push_str(&artifact.content),
            None => out.push_str(&rest[open..open + close + 4]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub sequential: Vec<TaskDecl>,
    #[serde(default)]
    pub parallel: Vec<TaskDecl>,
}

/// Result of validating a plan file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSummary {
    pub sequential: Vec<TaskId>,
    /// Parallel tasks in a valid execution order.
    pub parallel_order: Vec<TaskId>,
    pub dependency_count: usize,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn sequential_tasks(&self) -> Vec<Task> {
        self.sequential.iter().map(TaskDecl::to_task).collect()
    }

    pub fn parallel_tasks(&self) -> Vec<Task> {
        self.parallel.iter().map(TaskDecl::to_task).collect()
    }

    /// Validate both task lists the same way a run would.
    pub fn validate(&self) -> Result<PlanSummary> {
        let sequential = self.sequential_tasks();
        validate_sequence(&sequential)?;
        let foundation: Vec<TaskId> = sequential.iter().map(|t| t.id.clone()).collect();
        let plan = ExecutionPlan::build(self.parallel_tasks(), foundation.clone())?;
        Ok(PlanSummary {
            sequential: foundation,
            parallel_order: plan
                .topological_order()
                .into_iter()
                .map(|t| t.id.clone())
                .collect(),
            dependency_count: plan.dependency_count(),
        })
    }
}
