use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{DeterministicHandler, HandlerInput};

/// Registry of deterministic handlers, looked up by name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DeterministicHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, handler: impl DeterministicHandler) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeterministicHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Run a handler by name.
    pub fn run(&self, name: &str, input: HandlerInput<'_>) -> Result<Value> {
        let handler = self
            .get(name)
            .ok_or_else(|| TrellisError::HandlerNotFound(name.to_string()))?;
        handler.run(input)
    }

    /// Create a registry with the built-in handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Identity);
        registry.register(Concat);
        registry.register(Fail);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Returns its input unchanged.
pub struct Identity;

impl DeterministicHandler for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn run(&self, input: HandlerInput<'_>) -> Result<Value> {
        Ok(input.input.clone())
    }
}

/// Joins an array input (such as a merge node's inputs) into one string.
/// Non-array input passes through.
pub struct Concat;

impl DeterministicHandler for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn run(&self, input: HandlerInput<'_>) -> Result<Value> {
        let Some(parts) = input.input.as_array() else {
            return Ok(input.input.clone());
        };
        let joined = parts
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Value::String(joined))
    }
}

/// Always fails. Useful for failure-path routing.
pub struct Fail;

impl DeterministicHandler for Fail {
    fn name(&self) -> &str {
        "fail"
    }

    fn run(&self, input: HandlerInput<'_>) -> Result<Value> {
        Err(TrellisError::Handler {
            handler: "fail".into(),
            message: format!("forced failure at {}", input.stage_id),
        })
    }
}
