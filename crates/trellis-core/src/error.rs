use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Profile errors
    #[error("Unknown context profile: {0}")]
    UnknownProfile(String),

    #[error("Profile {profile}: max_tokens must be > 0 (got {max_tokens})")]
    InvalidTokenBudget { profile: String, max_tokens: i64 },

    #[error("Profile {profile}: unsupported retrieval policy '{policy}'")]
    UnsupportedRetrievalPolicy { profile: String, policy: String },

    #[error("Profile {profile}: unknown memory scope '{scope}'")]
    UnknownScope { profile: String, scope: String },

    #[error("Profile {profile}: source weight must be a positive number (got {weight})")]
    InvalidSourceWeight { profile: String, weight: f64 },

    // DAG validation errors
    #[error("Malformed exit node {node}: {reason}")]
    MalformedExitNode { node: String, reason: String },

    #[error("Node {0} declares always_fail but is not an EXIT node")]
    AlwaysFailOutsideExit(String),

    #[error("Node {0} declares merge_failure_mode but is not a MERGE node")]
    MergeModeOutsideMerge(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node referenced: {0}")]
    UnknownNode(String),

    #[error("Graph contains a cycle through node {0}")]
    CycleDetected(String),

    #[error("Entry node error: {0}")]
    EntryNode(String),

    #[error("Node {node}: {reason}")]
    DanglingNode { node: String, reason: String },

    // Runtime errors
    #[error("Traversal stalled after node {0}: no outbound route and no exit reached")]
    Stalled(String),

    #[error("Exit node {node} reached while task status is {status}")]
    ExitInvariant { node: String, status: String },

    #[error("Node {0} reported failure")]
    NodeFailed(String),

    #[error("Merge node {node}: {failed} of {total} inputs failed")]
    MergeFailed {
        node: String,
        failed: usize,
        total: usize,
    },

    #[error("Node {0} finished without an explicit status")]
    UnresolvedNodeStatus(String),

    #[error("Node {node} timed out after {timeout_secs}s")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("Agent runtime failed: {0}")]
    AgentRuntime(String),

    #[error("Handler {handler} failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    // Storage errors
    #[error("Memory item not found: {0}")]
    NotFound(String),

    #[error("Memory storage error: {0}")]
    Storage(String),

    // Task errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} has already concluded")]
    TaskConcluded(String),

    #[error("Task {0} has not concluded")]
    TaskActive(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrellisError {
    /// Stable snake_case name of the variant, used in history records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownProfile(_) => "unknown_profile",
            Self::InvalidTokenBudget { .. } => "invalid_token_budget",
            Self::UnsupportedRetrievalPolicy { .. } => "unsupported_retrieval_policy",
            Self::UnknownScope { .. } => "unknown_scope",
            Self::InvalidSourceWeight { .. } => "invalid_source_weight",
            Self::MalformedExitNode { .. } => "malformed_exit_node",
            Self::AlwaysFailOutsideExit(_) => "always_fail_outside_exit",
            Self::MergeModeOutsideMerge(_) => "merge_mode_outside_merge",
            Self::DuplicateNode(_) => "duplicate_node",
            Self::UnknownNode(_) => "unknown_node",
            Self::CycleDetected(_) => "cycle_detected",
            Self::EntryNode(_) => "entry_node",
            Self::DanglingNode { .. } => "dangling_node",
            Self::Stalled(_) => "stalled",
            Self::ExitInvariant { .. } => "exit_invariant",
            Self::NodeFailed(_) => "node_failed",
            Self::MergeFailed { .. } => "merge_failed",
            Self::UnresolvedNodeStatus(_) => "unresolved_node_status",
            Self::NodeTimeout { .. } => "node_timeout",
            Self::AgentRuntime(_) => "agent_runtime",
            Self::Handler { .. } => "handler",
            Self::HandlerNotFound(_) => "handler_not_found",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::TaskNotFound(_) => "task_not_found",
            Self::TaskConcluded(_) => "task_concluded",
            Self::TaskActive(_) => "task_active",
            Self::Config(_) => "config",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Io(_) => "io",
        }
    }

    /// Whether this error belongs to the load-time validation family.
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            Self::InvalidTokenBudget { .. }
                | Self::UnsupportedRetrievalPolicy { .. }
                | Self::UnknownScope { .. }
                | Self::InvalidSourceWeight { .. }
                | Self::MalformedExitNode { .. }
                | Self::AlwaysFailOutsideExit(_)
                | Self::MergeModeOutsideMerge(_)
                | Self::DuplicateNode(_)
                | Self::UnknownNode(_)
                | Self::CycleDetected(_)
                | Self::EntryNode(_)
                | Self::DanglingNode { .. }
                | Self::HandlerNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Serializable form of a runtime error, kept in task history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl From<&TrellisError> for ErrorDescriptor {
    fn from(e: &TrellisError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<TrellisError> for ErrorDescriptor {
    fn from(e: TrellisError) -> Self {
        Self::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_error() {
        let err = TrellisError::UnknownProfile("p9".into());
        let desc = ErrorDescriptor::from(&err);
        assert_eq!(desc.kind, "unknown_profile");
        assert_eq!(desc.message, "Unknown context profile: p9");
    }

    #[test]
    fn test_load_time_classification() {
        assert!(TrellisError::CycleDetected("a".into()).is_load_time());
        assert!(TrellisError::InvalidTokenBudget {
            profile: "p".into(),
            max_tokens: 0
        }
        .is_load_time());
        assert!(!TrellisError::TaskActive("t".into()).is_load_time());
        assert!(!TrellisError::UnknownProfile("p".into()).is_load_time());
    }
}
