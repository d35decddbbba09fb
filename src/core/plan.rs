//! Execution plan: the validated task graph for one run.
//!
//! The plan is built once, before scheduling starts, and is read-only
//! afterwards. Construction rejects duplicate IDs, references to unknown
//! tasks and dependency cycles, so a scheduler driving a plan can never
//! deadlock on a configuration defect.

use crate::core::task::{Task, TaskId};
use crate::error::PlanError;
use crate::orchestration::CapabilityRegistry;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// The task dependency graph for one run.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`. Dependencies
/// on tasks outside the plan are allowed only when they were declared as
/// already satisfied (e.g. foundational artifacts from the sequential stage).
pub struct ExecutionPlan {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Dependencies completed before the plan runs.
    satisfied: BTreeSet<TaskId>,
}

impl ExecutionPlan {
    /// Build and validate a plan.
    ///
    /// # Arguments
    /// * `tasks` - Tasks to schedule, in declaration order
    /// * `satisfied` - IDs of tasks completed outside this plan
    ///
    /// # Errors
    /// Returns a [`PlanError`] if a task ID repeats (or collides with a
    /// satisfied ID), a dependency names an unknown task, or the graph
    /// contains a cycle.
    pub fn build<I>(tasks: Vec<Task>, satisfied: I) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = TaskId>,
    {
        let satisfied: BTreeSet<TaskId> = satisfied.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for task in tasks {
            if task_index.contains_key(&task.id) || satisfied.contains(&task.id) {
                return Err(PlanError::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dependency in &task.dependencies {
                if dependency == &task.id {
                    return Err(PlanError::Cycle(task.id.clone()));
                }
                match task_index.get(dependency) {
                    Some(&dep_index) => edges.push((dep_index, index)),
                    None if satisfied.contains(dependency) => {}
                    None => {
                        return Err(PlanError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanError::Cycle(graph[cycle.node_id()].id.clone()));
        }

        Ok(Self {
            graph,
            task_index,
            satisfied,
        })
    }

    /// Check that every task's kind resolves to a generator.
    pub fn ensure_routed(&self, registry: &CapabilityRegistry) -> Result<(), PlanError> {
        registry.ensure_routes(self.tasks())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the plan.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges inside the plan.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// IDs declared as completed outside the plan.
    pub fn satisfied(&self) -> &BTreeSet<TaskId> {
        &self.satisfied
    }

    /// Tasks inside the plan that depend directly on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks inside the plan that `id` depends on directly.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| &self.graph[n].id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of unmet in-plan dependencies per task.
    ///
    /// Satisfied external dependencies never count.
    pub fn in_degrees(&self) -> HashMap<TaskId, usize> {
        self.graph
            .node_indices()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (self.graph[index].id.clone(), degree)
            })
            .collect()
    }

    /// Get tasks in topological order (respecting dependencies).
    pub fn topological_order(&self) -> Vec<&Task> {
        // Cycles are rejected in build(), so toposort cannot fail here.
        toposort(&self.graph, None)
            .map(|sorted| sorted.into_iter().map(|i| &self.graph[i]).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("satisfied", &self.satisfied.len())
            .finish()
    }
}

/// Validate an ordered list of sequential tasks.
///
/// Each task may only depend on tasks that appear earlier in the list.
pub fn validate_sequence(tasks: &[Task]) -> Result<(), PlanError> {
    let mut seen: BTreeSet<&TaskId> = BTreeSet::new();
    for task in tasks {
        if seen.contains(&task.id) {
            return Err(PlanError::DuplicateTask(task.id.clone()));
        }
        for dependency in &task.dependencies {
            if !seen.contains(dependency) {
                return Err(PlanError::ForwardReference {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        seen.insert(&task.id);
    }
    Ok(())
}
