//! Append-only result store shared by the stages of one run.

use crate::core::task::{Artifact, DependencyOutputs, TaskId};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Map from task ID to its artifact. Each key is written exactly once.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    inner: Arc<RwLock<BTreeMap<TaskId, Artifact>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the artifact for `task_id`.
    ///
    /// Returns `DuplicateResult` if the task already has one.
    pub async fn insert(&self, task_id: TaskId, artifact: Artifact) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&task_id) {
            return Err(Error::DuplicateResult(task_id));
        }
        inner.insert(task_id, artifact);
        Ok(())
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<Artifact> {
        self.inner.read().await.get(task_id).cloned()
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.read().await.contains_key(task_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Artifacts for the given IDs. Missing IDs are left out.
    pub async fn select<'a, I>(&self, ids: I) -> DependencyOutputs
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let inner = self.inner.read().await;
        ids.into_iter()
            .filter_map(|id| inner.get(id).map(|a| (id.clone(), a.clone())))
            .collect()
    }

    /// Copy of every stored artifact.
    pub async fn snapshot(&self) -> BTreeMap<TaskId, Artifact> {
        self.inner.read().await.clone()
    }
}
