use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{Task, TaskId, TaskStatus};

/// Shared handle to one task.
///
/// The task itself sits behind a per-task async mutex; the router holds it
/// only while reading a snapshot or applying a node's result, never across
/// a node execution.
pub struct TaskHandle {
    id: TaskId,
    state: Mutex<Task>,
    cancel: CancellationToken,
    unblocked: Notify,
    started: AtomicBool,
}

impl TaskHandle {
    pub fn new(task: Task, cancel: CancellationToken) -> Self {
        Self {
            id: task.id.clone(),
            state: Mutex::new(task),
            cancel,
            unblocked: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Task> {
        self.state.lock().await
    }

    /// A consistent copy of the task's current state.
    pub async fn snapshot(&self) -> Task {
        self.state.lock().await.clone()
    }

    /// Claim the task for traversal. Only the first caller gets `true`.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cooperative cancellation. A task that never started is
    /// concluded at CANCELLED right away; a running one stops before its
    /// next node. Returns true if this call concluded the task.
    pub async fn cancel(&self) -> bool {
        self.cancel.cancel();
        let mut task = self.lock().await;
        let not_started = task.status == TaskStatus::Pending
            || (task.status == TaskStatus::Blocked
                && task.held_status == Some(TaskStatus::Pending));
        not_started && task.conclude(TaskStatus::Cancelled)
    }

    /// Put the task in the BLOCKED holding state. The router stops before
    /// the next node until `unblock` is called.
    pub async fn block(&self) -> Result<()> {
        let mut task = self.lock().await;
        if task.is_concluded() {
            return Err(TrellisError::TaskConcluded(self.id.to_string()));
        }
        if task.status != TaskStatus::Blocked {
            task.held_status = Some(task.status);
            task.status = TaskStatus::Blocked;
        }
        Ok(())
    }

    pub async fn unblock(&self) -> Result<()> {
        {
            let mut task = self.lock().await;
            if task.is_concluded() {
                return Err(TrellisError::TaskConcluded(self.id.to_string()));
            }
            if task.status == TaskStatus::Blocked {
                task.status = task.held_status.take().unwrap_or(TaskStatus::InProgress);
            }
        }
        self.unblocked.notify_waiters();
        Ok(())
    }

    /// Wait until the task may dispatch its next node. Returns false if the
    /// task was cancelled instead.
    pub(crate) async fn wait_runnable(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let notified = self.unblocked.notified();
            if self.lock().await.status != TaskStatus::Blocked {
                return true;
            }
            tracing::debug!(task_id = %self.id, "Task blocked, waiting for release");
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}
