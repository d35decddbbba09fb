//! Progress events for external observers.
//!
//! Delivery is fire-and-forget: a full or closed channel drops the event
//! rather than stalling the scheduler.

use crate::core::task::{TaskId, TaskState};
use crate::workflow::{RunPhase, RunStatus};
use tokio::sync::mpsc;
use tracing::trace;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A task moved to a new state.
    TaskStateChanged {
        task_id: TaskId,
        state: TaskState,
    },
    /// The run moved to a new phase.
    PhaseChanged { from: RunPhase, to: RunPhase },
    /// The run finished.
    RunFinished { status: RunStatus },
}

/// Optional, non-blocking event sender.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// Sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink and its receiving end with room for `buffer` events.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.try_send(event) {
                trace!(error = %err, "progress event dropped");
            }
        }
    }

    pub fn task_state(&self, task_id: &TaskId, state: &TaskState) {
        self.emit(ProgressEvent::TaskStateChanged {
            task_id: task_id.clone(),
            state: state.clone(),
        });
    }
}
