//! Status roll-up rules, as pure functions over snapshots.
//!
//! Nothing here touches a task. Callers take a snapshot of the inputs
//! (merge edges or children's statuses), compute, then apply the result
//! under the owning task's lock. Re-running on the same snapshot yields
//! the same answer.

use serde_json::Value;

use trellis_core::config::MergeFailureMode;
use trellis_core::types::{LineageRelation, NodeStatus, TaskStatus};

/// One upstream result delivered to a MERGE node along a traversed edge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub source: String,
    pub status: NodeStatus,
    pub output: Value,
}

/// What a merge does to the task's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    /// Leave the status as it is.
    Proceed,
    /// Mark the task PARTIAL and keep going.
    MarkPartial,
    /// Conclude the task at FAILED.
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Successful outputs, in arrival order.
    pub included: Vec<Value>,
    pub failed: usize,
    pub total: usize,
    pub effect: MergeEffect,
}

pub fn merge_outcome(mode: MergeFailureMode, inputs: &[MergeInput]) -> MergeOutcome {
    let total = inputs.len();
    let included: Vec<Value> = inputs
        .iter()
        .filter(|i| !i.status.is_failure())
        .map(|i| i.output.clone())
        .collect();
    let failed = total - included.len();

    let effect = match mode {
        MergeFailureMode::FailOnAny if failed > 0 => MergeEffect::Fail,
        MergeFailureMode::FailOnAny | MergeFailureMode::IgnoreFailures => MergeEffect::Proceed,
        MergeFailureMode::Partial if failed == 0 => MergeEffect::Proceed,
        MergeFailureMode::Partial if failed == total => MergeEffect::Fail,
        MergeFailureMode::Partial => MergeEffect::MarkPartial,
    };

    MergeOutcome {
        included,
        failed,
        total,
        effect,
    }
}

/// Clones: COMPLETED if any clone completed, FAILED otherwise.
/// `None` while any clone is still running (or there are none).
pub fn aggregate_clones(children: &[TaskStatus]) -> Option<TaskStatus> {
    if children.is_empty() || !children.iter().all(TaskStatus::is_terminal) {
        return None;
    }
    if children.contains(&TaskStatus::Completed) {
        Some(TaskStatus::Completed)
    } else {
        Some(TaskStatus::Failed)
    }
}

/// Subtasks: COMPLETED if all completed, FAILED if none did, PARTIAL otherwise.
/// `None` while any subtask is still running (or there are none).
pub fn aggregate_subtasks(children: &[TaskStatus]) -> Option<TaskStatus> {
    if children.is_empty() || !children.iter().all(TaskStatus::is_terminal) {
        return None;
    }
    let completed = children
        .iter()
        .filter(|s| **s == TaskStatus::Completed)
        .count();
    Some(match completed {
        0 => TaskStatus::Failed,
        n if n == children.len() => TaskStatus::Completed,
        _ => TaskStatus::Partial,
    })
}

pub fn aggregate(relation: LineageRelation, children: &[TaskStatus]) -> Option<TaskStatus> {
    match relation {
        LineageRelation::Clone => aggregate_clones(children),
        LineageRelation::Subtask => aggregate_subtasks(children),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(source: &str, ok: bool) -> MergeInput {
        MergeInput {
            source: source.into(),
            status: if ok {
                NodeStatus::Succeeded
            } else {
                NodeStatus::Failed
            },
            output: json!(source),
        }
    }

    #[test]
    fn test_partial_merge() {
        let partial = MergeFailureMode::Partial;
        let mixed = merge_outcome(partial, &[input("a", false), input("b", true)]);
        assert_eq!(mixed.effect, MergeEffect::MarkPartial);
        assert_eq!(mixed.included, vec![json!("b")]);

        let all_failed = merge_outcome(partial, &[input("a", false), input("b", false)]);
        assert_eq!(all_failed.effect, MergeEffect::Fail);

        let all_ok = merge_outcome(partial, &[input("a", true), input("b", true)]);
        assert_eq!(all_ok.effect, MergeEffect::Proceed);
        assert_eq!(all_ok.included.len(), 2);
    }

    #[test]
    fn test_fail_on_any_merge() {
        let inputs = [input("a", true), input("b", false)];
        let out = merge_outcome(MergeFailureMode::FailOnAny, &inputs);
        assert_eq!(out.effect, MergeEffect::Fail);
        assert_eq!(out.failed, 1);
        assert_eq!(out.total, 2);
    }

    #[test]
    fn test_ignore_failures_merge() {
        let out = merge_outcome(
            MergeFailureMode::IgnoreFailures,
            &[input("a", false), input("b", true), input("c", true)],
        );
        assert_eq!(out.effect, MergeEffect::Proceed);
        assert_eq!(out.included, vec![json!("b"), json!("c")]);
    }

    #[test]
    fn test_subtasks_partial() {
        let children = [TaskStatus::Completed, TaskStatus::Completed, TaskStatus::Failed];
        assert_eq!(aggregate_subtasks(&children), Some(TaskStatus::Partial));
        assert_eq!(
            aggregate_subtasks(&[TaskStatus::Completed; 3]),
            Some(TaskStatus::Completed)
        );
        assert_eq!(
            aggregate_subtasks(&[TaskStatus::Failed, TaskStatus::Cancelled]),
            Some(TaskStatus::Failed)
        );
    }

    #[test]
    fn test_clones_any_success() {
        let children = [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Failed];
        assert_eq!(aggregate_clones(&children), Some(TaskStatus::Completed));
        assert_eq!(
            aggregate_clones(&[TaskStatus::Failed, TaskStatus::Failed]),
            Some(TaskStatus::Failed)
        );
    }

    #[test]
    fn test_waits_for_terminal_children() {
        let children = [TaskStatus::Completed, TaskStatus::InProgress];
        assert_eq!(aggregate(LineageRelation::Clone, &children), None);
        assert_eq!(aggregate(LineageRelation::Subtask, &children), None);
        assert_eq!(aggregate(LineageRelation::Subtask, &[]), None);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let children = [TaskStatus::Completed, TaskStatus::Failed];
        let first = aggregate(LineageRelation::Subtask, &children);
        assert_eq!(first, aggregate(LineageRelation::Subtask, &children));
    }
}
