pub use trellis_core::config::EdgeCondition;
use trellis_core::config::EdgeConfig;
use trellis_core::types::NodeStatus;

/// A directed hop between two nodes, taken only when its condition holds
/// for the source node's result.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }

    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::Always)
    }

    /// Whether the router may follow this edge after the source node
    /// finished with `status` and produced `output`.
    pub fn fires(&self, status: NodeStatus, output: &serde_json::Value) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => !status.is_failure(),
            EdgeCondition::OnFailure => status.is_failure(),
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, status, output),
        }
    }
}

impl From<&EdgeConfig> for Edge {
    fn from(config: &EdgeConfig) -> Self {
        Self::new(config.from.as_str(), config.to.as_str(), config.condition.clone())
    }
}

/// Evaluate `key OP "value"` against a node result, where OP is `==`,
/// `!=` or `contains`.
///
/// `status` resolves to `"success"` or `"failure"`, `output` to a plain
/// string output, and any other key to a string field of an output object.
/// An expression that does not parse, or a key that does not resolve, is
/// false.
pub fn evaluate_condition(expr: &str, status: NodeStatus, output: &serde_json::Value) -> bool {
    let resolve = |key: &str| -> Option<String> {
        match key {
            "status" => Some(status.as_str().to_string()),
            "output" if output.is_string() => output.as_str().map(str::to_string),
            _ => output.get(key).and_then(|v| v.as_str()).map(str::to_string),
        }
    };

    // The first operator found wins.
    for op in ["contains", "!=", "=="] {
        let Some((key, expected)) = expr.split_once(op) else {
            continue;
        };
        let expected = expected.trim().trim_matches('"');
        let Some(actual) = resolve(key.trim()) else {
            return false;
        };
        return match op {
            "contains" => actual.contains(expected),
            "!=" => actual != expected,
            _ => actual == expected,
        };
    }
    false
}
