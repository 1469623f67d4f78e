use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::config::Manifest;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EngineEvent, EventBus};
use trellis_core::traits::AgentRuntime;
use trellis_core::types::{
    ContextMetadata, LineageRelation, ProjectId, StageExecutionRecord, Task, TaskId, TaskStatus,
};
use trellis_memory::MemoryHub;

use crate::context::{ContextAssembler, ProfileRegistry};
use crate::executor::NodeExecutor;
use crate::graph::{Dag, Node};
use crate::handlers::HandlerRegistry;
use crate::propagation::{self, MergeEffect, MergeInput};
use crate::task::TaskHandle;
use crate::tokens::counter_for;

/// How a parent task is split into concurrently running children.
#[derive(Debug, Clone)]
pub enum FanOut {
    /// `n` alternative attempts at the parent's input.
    Clones(usize),
    /// One required child per input.
    Subtasks(Vec<Value>),
}

struct WorkItem {
    node: String,
    input: Value,
}

/// The task manager.
///
/// Owns every submitted task and drives each one through the DAG, one node
/// at a time. Distinct tasks progress concurrently; a single task's
/// traversal is strictly sequential.
pub struct Engine {
    dag: Arc<Dag>,
    executor: NodeExecutor,
    memory: Arc<MemoryHub>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskHandle>>>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(dag: Dag, executor: NodeExecutor) -> Self {
        let memory = Arc::clone(executor.assembler().memory());
        Self {
            dag: Arc::new(dag),
            executor,
            memory,
            tasks: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Validate a manifest and build an engine with the built-in handlers.
    pub fn from_manifest(
        manifest: &Manifest,
        runtime: Arc<dyn AgentRuntime>,
        memory: Arc<MemoryHub>,
    ) -> Result<Self> {
        let handlers = HandlerRegistry::with_builtins();
        Self::from_manifest_with_handlers(manifest, runtime, memory, handlers)
    }

    pub fn from_manifest_with_handlers(
        manifest: &Manifest,
        runtime: Arc<dyn AgentRuntime>,
        memory: Arc<MemoryHub>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        let profiles = ProfileRegistry::from_manifest(manifest)?;
        let dag = Dag::from_manifest(manifest, &profiles, &handlers)?;
        let assembler = ContextAssembler::new(memory, counter_for(manifest.engine.token_counter))
            .with_fractions(manifest.engine.head_fraction, manifest.engine.tail_fraction);
        let executor =
            NodeExecutor::new(assembler, Arc::new(profiles), Arc::new(handlers), runtime);
        Ok(Self::new(dag, executor))
    }

    /// Share an event bus with other components.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn memory(&self) -> &Arc<MemoryHub> {
        &self.memory
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Create a PENDING task. Nothing runs until `run` or `fan_out`.
    pub async fn submit(&self, project: ProjectId, input: Value) -> TaskId {
        let task = Task::new(project, input);
        self.register(task, self.shutdown.child_token()).await
    }

    pub async fn submit_and_run(&self, project: ProjectId, input: Value) -> Result<Task> {
        let id = self.submit(project, input).await;
        self.run(&id).await
    }

    async fn register(&self, task: Task, cancel: CancellationToken) -> TaskId {
        let id = task.id.clone();
        let project = task.project.clone();
        let handle = Arc::new(TaskHandle::new(task, cancel));
        self.tasks.write().await.insert(id.clone(), handle);
        self.events.publish(EngineEvent::TaskSubmitted {
            task_id: id.clone(),
        });
        info!(task_id = %id, project = %project, "Task submitted");
        id
    }

    pub async fn handle(&self, id: &TaskId) -> Result<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TrellisError::TaskNotFound(id.to_string()))
    }

    pub async fn snapshot(&self, id: &TaskId) -> Result<Task> {
        Ok(self.handle(id).await?.snapshot().await)
    }

    /// Cooperative cancellation: an in-flight node finishes, nothing after it starts.
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        let handle = self.handle(id).await?;
        info!(task_id = %id, "Cancellation requested");
        if handle.cancel().await {
            self.on_concluded(&handle.snapshot().await);
        }
        Ok(())
    }

    pub async fn block(&self, id: &TaskId) -> Result<()> {
        self.handle(id).await?.block().await?;
        info!(task_id = %id, "Task blocked");
        Ok(())
    }

    pub async fn unblock(&self, id: &TaskId) -> Result<()> {
        self.handle(id).await?.unblock().await?;
        info!(task_id = %id, "Task unblocked");
        Ok(())
    }

    /// Drop a concluded task, and its fan-out children, from the engine.
    /// Returns how many tasks were removed.
    pub async fn forget(&self, id: &TaskId) -> Result<usize> {
        let mut pending = vec![self.handle(id).await?];
        let mut doomed = Vec::new();
        while let Some(handle) = pending.pop() {
            let task = handle.snapshot().await;
            if !task.is_concluded() {
                return Err(TrellisError::TaskActive(task.id.to_string()));
            }
            for child in &task.children {
                if let Ok(child) = self.handle(child).await {
                    pending.push(child);
                }
            }
            doomed.push(task.id);
        }

        let mut tasks = self.tasks.write().await;
        let removed = doomed.iter().filter(|id| tasks.remove(*id).is_some()).count();
        debug!(task_id = %id, removed, "Task forgotten");
        Ok(removed)
    }

    /// Number of tasks the engine still tracks.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Cancel every task this engine owns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drive a task from the entry node until it concludes, returning the
    /// final snapshot. A task that already started or concluded is returned
    /// as it is.
    pub async fn run(&self, id: &TaskId) -> Result<Task> {
        let handle = self.handle(id).await?;
        let input = {
            let task = handle.lock().await;
            if task.is_concluded() || !handle.mark_started() {
                return Ok(task.clone());
            }
            task.input.clone()
        };

        let start = WorkItem {
            node: self.dag.entry().to_string(),
            input,
        };
        self.traverse(&handle, start).await;

        let task = handle.snapshot().await;
        self.on_concluded(&task);
        Ok(task)
    }

    async fn traverse(&self, handle: &TaskHandle, start: WorkItem) {
        let task_id = handle.id();
        let mut stack = vec![start];
        let mut merges: Vec<(String, Vec<MergeInput>)> = Vec::new();
        let mut last = self.dag.entry().to_string();

        loop {
            let item = match stack.pop() {
                Some(item) => item,
                None if !merges.is_empty() => {
                    if !handle.wait_runnable().await {
                        handle.lock().await.conclude(TaskStatus::Cancelled);
                        return;
                    }
                    // A merge still reachable from another pending merge waits for it.
                    let next = merges
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, (id, _))| self.dag.rank(id))
                        .map_or(0, |(at, _)| at);
                    let (node_id, inputs) = merges.swap_remove(next);
                    match self.join(handle, &node_id, inputs).await {
                        Some(item) => item,
                        None => return,
                    }
                }
                None => {
                    let err = TrellisError::Stalled(last);
                    warn!(task_id = %task_id, error = %err, "Traversal stalled");
                    handle.lock().await.fail(&err);
                    return;
                }
            };

            if !handle.wait_runnable().await {
                handle.lock().await.conclude(TaskStatus::Cancelled);
                return;
            }

            let Some(node) = self.dag.node(&item.node) else {
                handle
                    .lock()
                    .await
                    .fail(TrellisError::UnknownNode(item.node.clone()));
                return;
            };

            let snapshot = {
                let mut task = handle.lock().await;
                if task.is_concluded() {
                    return;
                }
                if node.is_exit() && !enforce_exit_invariant(&mut task, node) {
                    warn!(
                        task_id = %task_id,
                        stage_id = %node.id,
                        "Exit reached while task is PENDING"
                    );
                    return;
                }
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::InProgress;
                }
                task.clone()
            };

            self.events.publish(EngineEvent::NodeStarted {
                task_id: task_id.clone(),
                stage_id: node.id.clone(),
            });
            debug!(task_id = %task_id, stage_id = %node.id, "Dispatching node");

            let execution = match self.executor.execute(&snapshot, node, &item.input).await {
                Ok(execution) => execution,
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        stage_id = %node.id,
                        error = %e,
                        "Node could not run"
                    );
                    let mut task = handle.lock().await;
                    task.history.push(StageExecutionRecord::failure(
                        &node.id,
                        ContextMetadata::default(),
                        &e,
                    ));
                    task.fail(&e);
                    return;
                }
            };

            let next_input = {
                let mut task = handle.lock().await;
                task.history.push(execution.record.clone());
                if execution.succeeded() {
                    task.output = execution.output.clone();
                }

                if node.is_exit() {
                    conclude_at_exit(&mut task, node);
                } else if !execution.succeeded() && !node.continue_on_failure {
                    let reason = execution
                        .record
                        .error
                        .clone()
                        .unwrap_or_else(|| TrellisError::NodeFailed(node.id.clone()).into());
                    task.fail(reason);
                }
                task.output.clone()
            };

            self.events.publish(EngineEvent::NodeCompleted {
                task_id: task_id.clone(),
                stage_id: node.id.clone(),
                status: execution.status(),
                tokens_used: execution.record.context_metadata.tokens_used,
            });

            if handle.lock().await.is_concluded() {
                return;
            }
            last = node.id.clone();

            let routes = self.dag.route(&node.id, execution.status(), &execution.output);
            if routes.is_empty() {
                debug!(task_id = %task_id, stage_id = %node.id, "No outbound edge matched");
            }
            for edge in routes.into_iter().rev() {
                match self.dag.node(&edge.to) {
                    Some(target) if target.is_merge() => {
                        let input = MergeInput {
                            source: node.id.clone(),
                            status: execution.status(),
                            output: execution.output.clone(),
                        };
                        match merges.iter_mut().find(|(id, _)| *id == edge.to) {
                            Some((_, inputs)) => inputs.push(input),
                            None => merges.push((edge.to.clone(), vec![input])),
                        }
                    }
                    _ => stack.push(WorkItem {
                        node: edge.to.clone(),
                        input: next_input.clone(),
                    }),
                }
            }
        }
    }

    /// Resolve a MERGE node's inputs. Returns the merge node's work item, or
    /// `None` if the merge concluded the task.
    async fn join(
        &self,
        handle: &TaskHandle,
        node_id: &str,
        inputs: Vec<MergeInput>,
    ) -> Option<WorkItem> {
        let node = self.dag.node(node_id)?;
        let outcome = propagation::merge_outcome(node.merge_failure_mode, &inputs);
        debug!(
            task_id = %handle.id(),
            stage_id = %node_id,
            inputs = outcome.total,
            failed = outcome.failed,
            effect = ?outcome.effect,
            "Merge inputs resolved"
        );

        match outcome.effect {
            MergeEffect::Fail => {
                let err = TrellisError::MergeFailed {
                    node: node_id.to_string(),
                    failed: outcome.failed,
                    total: outcome.total,
                };
                let mut task = handle.lock().await;
                task.history.push(StageExecutionRecord::failure(
                    node_id,
                    ContextMetadata::default(),
                    &err,
                ));
                task.fail(&err);
                return None;
            }
            MergeEffect::MarkPartial => {
                let mut task = handle.lock().await;
                if task.status == TaskStatus::Blocked {
                    task.held_status = Some(TaskStatus::Partial);
                } else {
                    task.status = TaskStatus::Partial;
                }
            }
            MergeEffect::Proceed => {}
        }

        Some(WorkItem {
            node: node_id.to_string(),
            input: Value::Array(outcome.included),
        })
    }

    /// Split a task into children that run concurrently, wait for all of
    /// them, then conclude the parent by aggregation.
    pub async fn fan_out(self: &Arc<Self>, parent: &TaskId, fan: FanOut) -> Result<TaskStatus> {
        let parent_handle = self.handle(parent).await?;
        let children = {
            let mut task = parent_handle.lock().await;
            if task.is_concluded() {
                return Err(TrellisError::TaskConcluded(parent.to_string()));
            }
            let (relation, inputs) = match fan {
                FanOut::Clones(n) => (LineageRelation::Clone, vec![task.input.clone(); n]),
                FanOut::Subtasks(inputs) => (LineageRelation::Subtask, inputs),
            };
            if inputs.is_empty() {
                return Err(TrellisError::Config("fan-out needs at least one child".into()));
            }
            if !parent_handle.mark_started() {
                return Err(TrellisError::Config(format!("task {} is already running", parent)));
            }
            let children: Vec<Task> = inputs
                .into_iter()
                .map(|input| Task::child_of(&task, relation, input))
                .collect();
            task.children = children.iter().map(|c| c.id.clone()).collect();
            task.status = TaskStatus::InProgress;
            children
        };

        info!(task_id = %parent, children = children.len(), "Fanning out");

        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            let token = parent_handle.cancel_token().child_token();
            ids.push(self.register(child, token).await);
        }

        let mut workers = JoinSet::new();
        for id in ids.iter().cloned() {
            let engine = Arc::clone(self);
            workers.spawn(async move { engine.run(&id).await });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(task_id = %parent, error = %e, "Child task errored"),
                Err(e) => warn!(task_id = %parent, error = %e, "Child worker panicked"),
            }
        }

        for id in &ids {
            let child = self.handle(id).await?;
            let mut task = child.lock().await;
            if !task.is_concluded() {
                task.fail(TrellisError::AgentRuntime(format!(
                    "worker for task {} exited before it concluded",
                    id
                )));
            }
        }

        self.aggregate(parent)
            .await?
            .ok_or_else(|| TrellisError::TaskNotFound(parent.to_string()))
    }

    /// Roll children's statuses up into the parent. `None` while any child
    /// is still running. Safe to call repeatedly: a concluded parent keeps
    /// the status it concluded with.
    pub async fn aggregate(&self, parent: &TaskId) -> Result<Option<TaskStatus>> {
        let parent_handle = self.handle(parent).await?;
        let child_ids = parent_handle.snapshot().await.children;

        let mut relation = None;
        let mut statuses = Vec::with_capacity(child_ids.len());
        for id in &child_ids {
            let child = self.snapshot(id).await?;
            relation = relation.or(child.lineage.map(|l| l.relation));
            statuses.push(child.status);
        }
        let Some(relation) = relation else {
            return Ok(None);
        };
        let Some(status) = propagation::aggregate(relation, &statuses) else {
            return Ok(None);
        };

        let concluded = {
            let mut task = parent_handle.lock().await;
            if task.is_concluded() {
                return Ok(Some(task.status));
            }
            let status = if parent_handle.is_cancelled() {
                TaskStatus::Cancelled
            } else {
                status
            };
            task.conclude(status);
            task.clone()
        };
        self.on_concluded(&concluded);
        Ok(Some(concluded.status))
    }

    fn on_concluded(&self, task: &Task) {
        match self.memory.purge_task(&task.id) {
            Ok(0) => {}
            Ok(n) => debug!(task_id = %task.id, items = n, "Task store purged"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to purge task store"),
        }
        self.events.publish(EngineEvent::TaskConcluded {
            task_id: task.id.clone(),
            status: task.status,
        });
        info!(
            task_id = %task.id,
            status = %task.status,
            stages = task.history.len(),
            "Task concluded"
        );
    }
}

/// An EXIT node must never run while the task is still PENDING. On
/// violation the task is failed with the violation recorded.
fn enforce_exit_invariant(task: &mut Task, node: &Node) -> bool {
    if task.status != TaskStatus::Pending {
        return true;
    }
    let err = TrellisError::ExitInvariant {
        node: node.id.clone(),
        status: task.status.to_string(),
    };
    task.history.push(StageExecutionRecord::failure(
        &node.id,
        ContextMetadata::default(),
        &err,
    ));
    task.fail(&err);
    false
}

/// Final status after an EXIT node ran: `always_fail` wins, PARTIAL set by
/// a merge survives, anything else completes.
fn conclude_at_exit(task: &mut Task, node: &Node) {
    let prior = match task.status {
        TaskStatus::Blocked => task.held_status.unwrap_or(TaskStatus::InProgress),
        other => other,
    };
    let status = if node.always_fail {
        TaskStatus::Failed
    } else if prior == TaskStatus::Partial {
        TaskStatus::Partial
    } else {
        TaskStatus::Completed
    };
    task.conclude(status);
}
