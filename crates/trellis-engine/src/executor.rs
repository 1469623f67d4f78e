use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use trellis_core::error::{ErrorDescriptor, Result, TrellisError};
use trellis_core::traits::{AgentRequest, AgentRuntime, HandlerInput};
use trellis_core::types::{ContextItem, ContextPackage, NodeStatus, StageExecutionRecord, Task};
use trellis_memory::ScopeKey;

use crate::context::{resolve_profile, ContextAssembler, ProfileRegistry};
use crate::graph::{Behavior, Node};
use crate::handlers::HandlerRegistry;

/// Result of executing one node: the history record plus the node's output.
#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub record: StageExecutionRecord,
    pub output: Value,
}

impl NodeExecution {
    pub fn status(&self) -> NodeStatus {
        self.record.node_status
    }

    pub fn succeeded(&self) -> bool {
        !self.record.node_status.is_failure()
    }
}

/// Runs single nodes: resolves the node's context, dispatches on its
/// behavior, and applies the optional write-to-memory step.
pub struct NodeExecutor {
    assembler: ContextAssembler,
    profiles: Arc<ProfileRegistry>,
    handlers: Arc<HandlerRegistry>,
    runtime: Arc<dyn AgentRuntime>,
}

impl NodeExecutor {
    pub fn new(
        assembler: ContextAssembler,
        profiles: Arc<ProfileRegistry>,
        handlers: Arc<HandlerRegistry>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            assembler,
            profiles,
            handlers,
            runtime,
        }
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Execute `node` for `task` with `input`.
    ///
    /// Node failures (agent-reported, runtime errors, timeouts, handler
    /// errors, missing status) come back as `Ok` with a failed record.
    /// `Err` is reserved for errors that must halt the task: context
    /// resolution and memory storage failures.
    pub async fn execute(&self, task: &Task, node: &Node, input: &Value) -> Result<NodeExecution> {
        let key = ScopeKey::new(task.id.clone(), task.project.clone());
        let profile = resolve_profile(&node.context, &self.profiles)?;
        let context = self.assembler.build(&key, profile.as_deref())?;
        let metadata = context.metadata();

        let (status, output, error) = match node.behavior() {
            Behavior::Passthrough => (NodeStatus::Succeeded, task.output.clone(), None),
            Behavior::InvokeAgent => self.invoke_agent(task, node, input, &context).await,
            Behavior::RunHandler => self.run_handler(task, node, input, &context),
        };

        if let Some(err) = &error {
            warn!(task_id = %task.id, stage_id = %node.id, error = %err.message, "Node failed");
        }

        let record = StageExecutionRecord {
            stage_id: node.id.clone(),
            node_status: status,
            context_metadata: metadata,
            timestamp: Utc::now(),
            error,
        };

        if status == NodeStatus::Succeeded {
            self.write_memory(task, node, &key, &output)?;
        }

        debug!(
            task_id = %task.id,
            stage_id = %node.id,
            status = status.as_str(),
            tokens_used = record.context_metadata.tokens_used,
            "Node executed"
        );
        Ok(NodeExecution { record, output })
    }

    async fn invoke_agent(
        &self,
        task: &Task,
        node: &Node,
        input: &Value,
        context: &ContextPackage,
    ) -> (NodeStatus, Value, Option<ErrorDescriptor>) {
        let request = AgentRequest {
            task_id: &task.id,
            stage_id: &node.id,
            input,
            context,
            tools: &node.tools,
        };

        let result = match node.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.runtime.run(request)).await {
                Ok(result) => result,
                Err(_) => Err(TrellisError::NodeTimeout {
                    node: node.id.clone(),
                    timeout_secs: limit.as_secs(),
                }),
            },
            None => self.runtime.run(request).await,
        };

        match result {
            Ok(response) => match response.status {
                Some(NodeStatus::Succeeded) => (NodeStatus::Succeeded, response.output, None),
                Some(NodeStatus::Failed) => (NodeStatus::Failed, response.output, None),
                None => (
                    NodeStatus::Failed,
                    response.output,
                    Some(TrellisError::UnresolvedNodeStatus(node.id.clone()).into()),
                ),
            },
            Err(e) => (NodeStatus::Failed, Value::Null, Some(e.into())),
        }
    }

    fn run_handler(
        &self,
        task: &Task,
        node: &Node,
        input: &Value,
        context: &ContextPackage,
    ) -> (NodeStatus, Value, Option<ErrorDescriptor>) {
        let handler_input = HandlerInput {
            task_id: &task.id,
            stage_id: &node.id,
            input,
            context,
        };
        match self.handlers.run(node.handler_name(), handler_input) {
            Ok(output) => (NodeStatus::Succeeded, output, None),
            Err(e) => (NodeStatus::Failed, Value::Null, Some(e.into())),
        }
    }

    fn write_memory(&self, task: &Task, node: &Node, key: &ScopeKey, output: &Value) -> Result<()> {
        let Some(directive) = &node.write_memory else {
            return Ok(());
        };
        let content = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let id = format!("{}:{}:{}", task.id, node.id, task.history.len());
        let item = ContextItem::new(id, content, directive.store)
            .with_tags(directive.tags.iter().cloned());
        self.assembler.memory().write(directive.store, key, item)?;
        debug!(
            task_id = %task.id,
            stage_id = %node.id,
            store = %directive.store,
            "Node output written to memory"
        );
        Ok(())
    }
}
