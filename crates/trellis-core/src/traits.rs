use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ContextPackage, NodeStatus, TaskId};

/// Everything an agent invocation gets to see.
#[derive(Debug)]
pub struct AgentRequest<'a> {
    pub task_id: &'a TaskId,
    pub stage_id: &'a str,
    pub input: &'a serde_json::Value,
    pub context: &'a ContextPackage,
    /// Tool names the node allows; tools are invoked by the runtime itself.
    pub tools: &'a [String],
}

/// What an agent invocation reported back.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub output: serde_json::Value,
    /// Must be set by the runtime; `None` is treated as an unresolved status.
    pub status: Option<NodeStatus>,
}

impl AgentResponse {
    pub fn succeeded(output: serde_json::Value) -> Self {
        Self {
            output,
            status: Some(NodeStatus::Succeeded),
        }
    }

    pub fn failed(output: serde_json::Value) -> Self {
        Self {
            output,
            status: Some(NodeStatus::Failed),
        }
    }
}

/// Agent runtime: the external LLM/tool layer behind AGENT nodes.
pub trait AgentRuntime: Send + Sync + 'static {
    /// Run one agent invocation. May suspend for an unbounded duration.
    fn run<'a>(&'a self, request: AgentRequest<'a>) -> BoxFuture<'a, Result<AgentResponse>>;
}

/// Input passed to a deterministic handler.
#[derive(Debug)]
pub struct HandlerInput<'a> {
    pub task_id: &'a TaskId,
    pub stage_id: &'a str,
    pub input: &'a serde_json::Value,
    pub context: &'a ContextPackage,
}

/// Deterministic transform behind DETERMINISTIC nodes.
///
/// `Ok` means the node succeeded; `Err` is recorded as a node failure.
pub trait DeterministicHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self, input: HandlerInput<'_>) -> Result<serde_json::Value>;
}
