//! Shared test utilities for Trellis crates.
//!
//! Provides a scripted agent runtime and fixture builders for memory items
//! and manifests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;

use trellis_core::config::Manifest;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{AgentRequest, AgentResponse, AgentRuntime};
use trellis_core::types::{ContextItem, Scope};

/// Scripted result of one agent invocation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(serde_json::Value),
    Fail(serde_json::Value),
    /// Respond without a status.
    NoStatus(serde_json::Value),
    /// The runtime itself errors.
    Error(String),
    /// Echo the input back as a success.
    Echo,
}

/// Agent runtime whose answers are scripted per stage (and optionally per input).
///
/// Unscripted stages echo their input and succeed.
#[derive(Default)]
pub struct ScriptedRuntime {
    by_stage: HashMap<String, Outcome>,
    by_stage_input: Vec<(String, serde_json::Value, Outcome)>,
    sequences: Mutex<HashMap<String, VecDeque<Outcome>>>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<String, usize>>,
    seen_context: Mutex<Vec<(String, usize)>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, stage: &str, outcome: Outcome) -> Self {
        self.by_stage.insert(stage.to_string(), outcome);
        self
    }

    /// Script an outcome used only when the stage sees exactly `input`.
    pub fn script_for_input(
        mut self,
        stage: &str,
        input: serde_json::Value,
        outcome: Outcome,
    ) -> Self {
        self.by_stage_input.push((stage.to_string(), input, outcome));
        self
    }

    /// Answer successive calls of `stage` with `outcomes`, in order. Once
    /// drained, the stage falls back to its other scripts.
    pub fn script_sequence(self, stage: &str, outcomes: Vec<Outcome>) -> Self {
        if let Ok(mut seqs) = self.sequences.lock() {
            seqs.insert(stage.to_string(), outcomes.into());
        }
        self
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `stage` was invoked.
    pub fn calls(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(stage).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// `(stage, items in context)` for every invocation, in call order.
    pub fn seen_context(&self) -> Vec<(String, usize)> {
        self.seen_context.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn outcome_for(&self, stage: &str, input: &serde_json::Value) -> Outcome {
        let queued = self
            .sequences
            .lock()
            .ok()
            .and_then(|mut seqs| seqs.get_mut(stage).and_then(VecDeque::pop_front));
        if let Some(outcome) = queued {
            return outcome;
        }
        self.by_stage_input
            .iter()
            .find(|(s, i, _)| s == stage && i == input)
            .map(|(_, _, o)| o.clone())
            .or_else(|| self.by_stage.get(stage).cloned())
            .unwrap_or(Outcome::Echo)
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn run<'a>(&'a self, request: AgentRequest<'a>) -> BoxFuture<'a, Result<AgentResponse>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                *calls.entry(request.stage_id.to_string()).or_insert(0) += 1;
            }
            if let Ok(mut seen) = self.seen_context.lock() {
                seen.push((request.stage_id.to_string(), request.context.items().len()));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match self.outcome_for(request.stage_id, request.input) {
                Outcome::Succeed(v) => Ok(AgentResponse::succeeded(v)),
                Outcome::Fail(v) => Ok(AgentResponse::failed(v)),
                Outcome::NoStatus(v) => Ok(AgentResponse {
                    output: v,
                    status: None,
                }),
                Outcome::Error(msg) => Err(TrellisError::AgentRuntime(msg)),
                Outcome::Echo => Ok(AgentResponse::succeeded(request.input.clone())),
            }
        })
    }
}

/// A fixed UTC instant `secs` seconds after the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A memory item with a fixed timestamp.
pub fn item_at(id: &str, content: &str, secs: i64, scope: Scope) -> ContextItem {
    ContextItem::new(id, content, scope).with_timestamp(at(secs))
}

/// `n` whitespace-separated words (n tokens under the word counter).
pub fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}

/// Parse a manifest from TOML, panicking on malformed fixtures.
pub fn manifest(toml: &str) -> Manifest {
    Manifest::from_toml_str(toml).expect("fixture manifest must parse")
}

/// entry (agent) -> work (agent) -> done (exit), word-counted budgets.
pub const LINEAR_MANIFEST: &str = r#"
[engine]
token_counter = "words"

[[nodes]]
id = "start"
kind = "agent"
role = "entry"

[[nodes]]
id = "work"
kind = "agent"

[[nodes]]
id = "done"
kind = "deterministic"
role = "exit"

[[edges]]
from = "start"
to = "work"

[[edges]]
from = "work"
to = "done"
"#;

pub fn linear_manifest() -> Manifest {
    manifest(LINEAR_MANIFEST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_fixture() {
        assert_eq!(words(3), "w0 w1 w2");
        assert_eq!(words(0), "");
    }

    #[test]
    fn test_linear_manifest_parses() {
        let m = linear_manifest();
        assert_eq!(m.nodes.len(), 3);
        assert_eq!(m.edges.len(), 2);
    }
}
