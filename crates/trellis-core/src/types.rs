use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDescriptor;

/// Unique task identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project identifier shared by a task and all of its clones and subtasks.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visibility scope of a memory item.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Task,
    Project,
    Global,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "project" => Some(Self::Project),
            "global" => Some(Self::Global),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single stored memory entry. Immutable once stored; overwriting
/// the same id replaces the whole item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    pub scope: Scope,
}

impl ContextItem {
    /// Create an item stamped with the current time.
    pub fn new(id: impl Into<String>, content: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            timestamp: Utc::now(),
            scope,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// True if the item shares at least one tag with `tags`.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

/// Recency ordering: newest first, ties broken by id ascending.
pub fn recency_cmp(a: &ContextItem, b: &ContextItem) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id))
}

/// Chronological ordering: oldest first, ties broken by id ascending.
pub fn chronological_cmp(a: &ContextItem, b: &ContextItem) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

/// How one profile source contributed to a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub scope: Scope,
    pub candidates: usize,
    pub selected: usize,
    pub tokens_used: usize,
}

/// The immutable, budgeted context handed to one node execution.
///
/// Fields are only reachable through accessors; a package is built once by
/// the assembler and moved into the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPackage {
    profile_id: Option<String>,
    items: Vec<ContextItem>,
    tokens_used: usize,
    tokens_total: usize,
    sources: Vec<SourceBreakdown>,
    compression_ratio: f64,
}

impl ContextPackage {
    /// Package for nodes whose context spec is `none`.
    pub fn empty() -> Self {
        Self {
            profile_id: None,
            items: Vec::new(),
            tokens_used: 0,
            tokens_total: 0,
            sources: Vec::new(),
            compression_ratio: 1.0,
        }
    }

    /// Assemble a package. `items` must already be in final (chronological) order.
    pub fn assembled(
        profile_id: impl Into<String>,
        items: Vec<ContextItem>,
        tokens_used: usize,
        tokens_total: usize,
        sources: Vec<SourceBreakdown>,
    ) -> Self {
        let compression_ratio = if tokens_total == 0 {
            1.0
        } else {
            tokens_used as f64 / tokens_total as f64
        };
        Self {
            profile_id: Some(profile_id.into()),
            items,
            tokens_used,
            tokens_total,
            sources,
            compression_ratio,
        }
    }

    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    pub fn tokens_total(&self) -> usize {
        self.tokens_total
    }

    pub fn sources(&self) -> &[SourceBreakdown] {
        &self.sources
    }

    pub fn compression_ratio(&self) -> f64 {
        self.compression_ratio
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn metadata(&self) -> ContextMetadata {
        ContextMetadata {
            profile_id: self.profile_id.clone(),
            items_selected: self.items.len(),
            tokens_used: self.tokens_used,
            compression_ratio: self.compression_ratio,
        }
    }
}

/// Outcome of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
}

impl NodeStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "success",
            Self::Failed => "failure",
        }
    }
}

/// Task-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
            Self::Cancelled => "CANCELLED",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Active,
    Concluded,
}

/// How a child task relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageRelation {
    Clone,
    Subtask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent: TaskId,
    pub relation: LineageRelation,
}

/// Context metadata recorded for every stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub profile_id: Option<String>,
    pub items_selected: usize,
    pub tokens_used: usize,
    pub compression_ratio: f64,
}

impl Default for ContextMetadata {
    fn default() -> Self {
        ContextPackage::empty().metadata()
    }
}

/// One entry of a task's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    pub stage_id: String,
    pub node_status: NodeStatus,
    pub context_metadata: ContextMetadata,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl StageExecutionRecord {
    pub fn success(stage_id: impl Into<String>, context_metadata: ContextMetadata) -> Self {
        Self {
            stage_id: stage_id.into(),
            node_status: NodeStatus::Succeeded,
            context_metadata,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(
        stage_id: impl Into<String>,
        context_metadata: ContextMetadata,
        error: impl Into<ErrorDescriptor>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            node_status: NodeStatus::Failed,
            context_metadata,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// A unit of work travelling through the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,
    pub status: TaskStatus,
    pub lifecycle: Lifecycle,
    /// Input supplied at submission.
    pub input: serde_json::Value,
    /// Output of the most recent successful stage (starts as the input).
    pub output: serde_json::Value,
    pub history: Vec<StageExecutionRecord>,
    #[serde(default)]
    pub children: Vec<TaskId>,
    #[serde(default)]
    pub lineage: Option<Lineage>,
    /// Why the task concluded, when it did not finish cleanly.
    #[serde(default)]
    pub failure: Option<ErrorDescriptor>,
    /// Status to restore when a BLOCKED task is released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_status: Option<TaskStatus>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project: ProjectId, input: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            project,
            status: TaskStatus::Pending,
            lifecycle: Lifecycle::Active,
            output: input.clone(),
            input,
            history: Vec::new(),
            children: Vec::new(),
            lineage: None,
            failure: None,
            held_status: None,
            created_at: Utc::now(),
        }
    }

    pub fn child_of(parent: &Task, relation: LineageRelation, input: serde_json::Value) -> Self {
        let mut task = Self::new(parent.project.clone(), input);
        task.lineage = Some(Lineage {
            parent: parent.id.clone(),
            relation,
        });
        task
    }

    pub fn is_concluded(&self) -> bool {
        self.lifecycle == Lifecycle::Concluded
    }

    /// Set a final status and conclude. No-op on an already concluded task.
    pub fn conclude(&mut self, status: TaskStatus) -> bool {
        if self.is_concluded() {
            return false;
        }
        self.status = status;
        self.held_status = None;
        self.lifecycle = Lifecycle::Concluded;
        true
    }

    /// Conclude at FAILED, remembering why.
    pub fn fail(&mut self, reason: impl Into<ErrorDescriptor>) -> bool {
        if self.is_concluded() {
            return false;
        }
        self.failure = Some(reason.into());
        self.conclude(TaskStatus::Failed)
    }
}
