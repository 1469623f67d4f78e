use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::types::Scope;

/// Top-level workflow manifest: engine settings, context profiles, and the DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Budget of the built-in `global` profile.
    #[serde(default = "default_global_budget")]
    pub default_global_budget: usize,
    /// Share of a source budget reserved for the oldest items.
    #[serde(default = "default_head_fraction")]
    pub head_fraction: f64,
    /// Share of a source budget reserved for the newest items.
    #[serde(default = "default_tail_fraction")]
    pub tail_fraction: f64,
    #[serde(default)]
    pub token_counter: TokenCounterKind,
}

fn default_global_budget() -> usize {
    2_000
}

fn default_head_fraction() -> f64 {
    0.2
}

fn default_tail_fraction() -> f64 {
    0.3
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_global_budget: default_global_budget(),
            head_fraction: default_head_fraction(),
            tail_fraction: default_tail_fraction(),
            token_counter: TokenCounterKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCounterKind {
    /// cl100k BPE tokenization.
    #[default]
    Bpe,
    /// One token per whitespace-separated word.
    Words,
}

/// Raw context profile as written in the manifest. Validated into a
/// `ContextProfile` by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub id: String,
    pub max_tokens: i64,
    #[serde(default = "default_retrieval")]
    pub retrieval: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_retrieval() -> String {
    "recency".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub scope: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Deterministic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Entry,
    Standard,
    Branch,
    Split,
    Merge,
    Exit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFailureMode {
    #[default]
    FailOnAny,
    IgnoreFailures,
    Partial,
}

/// Directive to persist a node's output as a memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWriteConfig {
    pub store: Scope,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A node as written in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    /// `none`, `global`, or a profile id.
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub always_fail: Option<bool>,
    #[serde(default)]
    pub merge_failure_mode: Option<MergeFailureMode>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Registered handler name for deterministic nodes.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub write_memory: Option<MemoryWriteConfig>,
}

fn default_role() -> NodeRole {
    NodeRole::Standard
}

fn default_context() -> String {
    "none".to_string()
}

/// An edge as written in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source node succeeded.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if a simple expression matches the source node's output.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl Manifest {
    /// Load a manifest from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => TrellisError::ConfigNotFound(path.display().to_string()),
            _ => TrellisError::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a manifest from TOML text after substituting environment
    /// references (see `substitute_env`).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = substitute_env(content, |name| std::env::var(name).ok());
        toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Replace `${NAME}` with `lookup(NAME)` and `${NAME:-fallback}` with the
/// fallback when NAME is unset. Unset names without a fallback, and an
/// unterminated `${`, stay in the text as written so TOML parsing reports
/// them.
fn substitute_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            break;
        };
        let reference = &rest[open..open + 2 + close + 1];
        let (name, fallback) = match body[..close].split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (&body[..close], None),
        };
        match (lookup(name), fallback) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => out.push_str(reference),
        }
        rest = &body[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "BUDGET" => Some("120".into()),
            "MODE" => Some("partial".into()),
            _ => None,
        }
    }

    #[test]
    fn test_substitute_env() {
        let text = "max_tokens = ${BUDGET}\nmerge_failure_mode = \"${MODE}\"";
        assert_eq!(
            substitute_env(text, env),
            "max_tokens = 120\nmerge_failure_mode = \"partial\""
        );
    }

    #[test]
    fn test_substitute_env_fallback_and_unset() {
        assert_eq!(substitute_env("${UNSET:-40} ${BUDGET:-7}", env), "40 120");
        assert_eq!(substitute_env("x = \"${UNSET}\"", env), "x = \"${UNSET}\"");
        assert_eq!(substitute_env("tail ${BUDGET", env), "tail ${BUDGET");
        assert_eq!(substitute_env("$HOME and $", env), "$HOME and $");
    }

    #[test]
    fn test_node_defaults_from_minimal_toml() {
        let manifest = Manifest::from_toml_str(
            r#"
[[nodes]]
id = "work"
kind = "agent"
"#,
        )
        .unwrap();
        let node = manifest.node("work").unwrap();
        assert_eq!(node.role, NodeRole::Standard);
        assert_eq!(node.context, "none");
        assert!(!node.continue_on_failure);
        assert!(node.always_fail.is_none());
        assert!(node.merge_failure_mode.is_none());
        assert!(node.tools.is_empty());
        assert_eq!(manifest.engine.default_global_budget, 2_000);
        assert_eq!(manifest.engine.token_counter, TokenCounterKind::Bpe);
    }

    #[test]
    fn test_edge_condition_parsing() {
        let manifest = Manifest::from_toml_str(
            r#"
[[edges]]
from = "a"
to = "b"

[[edges]]
from = "a"
to = "c"
condition = { type = "on_failure" }

[[edges]]
from = "b"
to = "c"
condition = { type = "conditional", expr = 'verdict == "ok"' }
"#,
        )
        .unwrap();
        assert_eq!(manifest.edges[0].condition, EdgeCondition::Always);
        assert_eq!(manifest.edges[1].condition, EdgeCondition::OnFailure);
        assert!(matches!(
            manifest.edges[2].condition,
            EdgeCondition::Conditional { .. }
        ));
    }

    #[test]
    fn test_negative_budget_parses_for_later_validation() {
        let manifest = Manifest::from_toml_str(
            r#"
[[profiles]]
id = "bad"
max_tokens = -5
retrieval = "semantic"

[[profiles.sources]]
scope = "session"
"#,
        )
        .unwrap();
        let p = &manifest.profiles[0];
        assert_eq!(p.max_tokens, -5);
        assert_eq!(p.retrieval, "semantic");
        assert_eq!(p.sources[0].scope, "session");
    }

    #[test]
    fn test_write_memory_directive() {
        let manifest = Manifest::from_toml_str(
            r#"
[[nodes]]
id = "summarize"
kind = "deterministic"
handler = "identity"

[nodes.write_memory]
store = "project"
tags = ["summary"]
"#,
        )
        .unwrap();
        let wm = manifest.nodes[0].write_memory.as_ref().unwrap();
        assert_eq!(wm.store, Scope::Project);
        assert_eq!(wm.tags, vec!["summary"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/trellis.toml")).unwrap_err();
        assert!(matches!(err, TrellisError::ConfigNotFound(_)));
    }
}
