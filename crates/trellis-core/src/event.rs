use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{NodeStatus, TaskId, TaskStatus};

/// Engine lifecycle events for an external reporting layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskSubmitted {
        task_id: TaskId,
    },
    NodeStarted {
        task_id: TaskId,
        stage_id: String,
    },
    NodeCompleted {
        task_id: TaskId,
        stage_id: String,
        status: NodeStatus,
        tokens_used: usize,
    },
    TaskConcluded {
        task_id: TaskId,
        status: TaskStatus,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskSubmitted { task_id }
            | Self::NodeStarted { task_id, .. }
            | Self::NodeCompleted { task_id, .. }
            | Self::TaskConcluded { task_id, .. } => task_id,
        }
    }
}

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of engine events to any number of observers.
///
/// Publishing never blocks traversal. A receiver that falls more than the
/// channel capacity behind sees `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many observers received the event.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
