use std::time::Duration;

use trellis_core::config::{MemoryWriteConfig, MergeFailureMode, NodeConfig, NodeKind, NodeRole};
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::Scope;

use crate::context::ContextSpec;

/// Name of the handler used by deterministic nodes that don't name one.
pub const DEFAULT_HANDLER: &str = "identity";

/// What executing a node actually does, looked up from `(kind, role)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Return the task's current output unchanged. EXIT nodes only.
    Passthrough,
    /// Delegate to the agent runtime.
    InvokeAgent,
    /// Run a registered deterministic handler.
    RunHandler,
}

impl Behavior {
    pub fn of(kind: NodeKind, role: NodeRole) -> Self {
        match (kind, role) {
            (_, NodeRole::Exit) => Self::Passthrough,
            (NodeKind::Agent, _) => Self::InvokeAgent,
            (NodeKind::Deterministic, _) => Self::RunHandler,
        }
    }
}

/// A validated DAG node.
///
/// One record type for every kind/role combination; role-specific fields
/// (`always_fail`, `merge_failure_mode`) are checked once when the DAG loads.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub role: NodeRole,
    pub context: ContextSpec,
    pub continue_on_failure: bool,
    pub always_fail: bool,
    pub merge_failure_mode: MergeFailureMode,
    pub tools: Vec<String>,
    pub handler: Option<String>,
    pub timeout: Option<Duration>,
    pub write_memory: Option<MemoryWriteConfig>,
}

impl Node {
    /// Create a node with default settings.
    pub fn new(id: impl Into<String>, kind: NodeKind, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            kind,
            role,
            context: ContextSpec::None,
            continue_on_failure: false,
            always_fail: false,
            merge_failure_mode: MergeFailureMode::default(),
            tools: vec![],
            handler: None,
            timeout: None,
            write_memory: None,
        }
    }

    pub fn agent(id: impl Into<String>, role: NodeRole) -> Self {
        Self::new(id, NodeKind::Agent, role)
    }

    pub fn deterministic(id: impl Into<String>, role: NodeRole) -> Self {
        Self::new(id, NodeKind::Deterministic, role)
    }

    /// A deterministic pass-through EXIT node.
    pub fn exit(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Deterministic, NodeRole::Exit)
    }

    pub fn with_context(mut self, spec: ContextSpec) -> Self {
        self.context = spec;
        self
    }

    pub fn continue_on_failure(mut self, yes: bool) -> Self {
        self.continue_on_failure = yes;
        self
    }

    pub fn always_fail(mut self, yes: bool) -> Self {
        self.always_fail = yes;
        self
    }

    pub fn with_merge_mode(mut self, mode: MergeFailureMode) -> Self {
        self.merge_failure_mode = mode;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn writes_memory(mut self, store: Scope, tags: Vec<String>) -> Self {
        self.write_memory = Some(MemoryWriteConfig { store, tags });
        self
    }

    /// Build and validate a node from its manifest form.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        if config.always_fail.is_some() && config.role != NodeRole::Exit {
            return Err(TrellisError::AlwaysFailOutsideExit(config.id.clone()));
        }
        if config.merge_failure_mode.is_some() && config.role != NodeRole::Merge {
            return Err(TrellisError::MergeModeOutsideMerge(config.id.clone()));
        }

        let node = Self {
            id: config.id.clone(),
            kind: config.kind,
            role: config.role,
            context: ContextSpec::parse(&config.context),
            continue_on_failure: config.continue_on_failure,
            always_fail: config.always_fail.unwrap_or(false),
            merge_failure_mode: config.merge_failure_mode.unwrap_or_default(),
            tools: config.tools.clone(),
            handler: config.handler.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            write_memory: config.write_memory.clone(),
        };
        node.validate()?;
        Ok(node)
    }

    /// Checks that only depend on the node itself.
    pub fn validate(&self) -> Result<()> {
        if self.role == NodeRole::Exit {
            if self.kind != NodeKind::Deterministic {
                return Err(TrellisError::MalformedExitNode {
                    node: self.id.clone(),
                    reason: "exit nodes must be deterministic".into(),
                });
            }
            if !self.tools.is_empty() {
                return Err(TrellisError::MalformedExitNode {
                    node: self.id.clone(),
                    reason: format!(
                        "exit nodes may not declare tools (found {})",
                        self.tools.join(", ")
                    ),
                });
            }
        } else if self.always_fail {
            return Err(TrellisError::AlwaysFailOutsideExit(self.id.clone()));
        }
        Ok(())
    }

    pub fn behavior(&self) -> Behavior {
        Behavior::of(self.kind, self.role)
    }

    /// Handler name for deterministic non-exit nodes.
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(DEFAULT_HANDLER)
    }

    pub fn is_exit(&self) -> bool {
        self.role == NodeRole::Exit
    }

    pub fn is_merge(&self) -> bool {
        self.role == NodeRole::Merge
    }
}
