//! Tool registry and trait definition.
//!
//! Defines the `Tool` async trait for individual capabilities and the
//! `ToolExecutor` seam the orchestrator calls through. Every execution
//! re-validates its input against the tool's contract first.

pub mod deal_search;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ChatError;

/// Loosely-typed tool input as received from the model or echoed by a client.
pub type ToolInput = BTreeMap<String, Value>;

/// Name, purpose and input schema of a tool, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Structured results of a tool run. Serializes as a bare JSON array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolOutput(pub Vec<Value>);

impl ToolOutput {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single named capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Check `input` against the declared contract without running anything.
    fn validate(&self, input: &ToolInput) -> Result<(), ChatError>;

    /// Run the tool. Called only with input that passed `validate`.
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ChatError>;
}

/// What the orchestrator needs from a set of tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn catalog(&self) -> Vec<ToolSpec>;

    fn knows(&self, name: &str) -> bool;

    fn validate(&self, name: &str, input: &ToolInput) -> Result<(), ChatError>;

    async fn execute(&self, name: &str, input: &ToolInput) -> Result<ToolOutput, ChatError>;
}

/// Registry mapping tool names to implementations.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec name, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.spec().name, tool);
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn Tool>, ChatError> {
        self.tools
            .get(name)
            .ok_or_else(|| ChatError::InvalidToolInput(format!("unknown tool '{}'", name)))
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn catalog(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    fn knows(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    fn validate(&self, name: &str, input: &ToolInput) -> Result<(), ChatError> {
        self.get(name)?.validate(input)
    }

    async fn execute(&self, name: &str, input: &ToolInput) -> Result<ToolOutput, ChatError> {
        let tool = self.get(name)?;
        tool.validate(input)?;
        match tool.execute(input).await {
            Ok(output) => {
                tracing::info!(tool = name, results = output.len(), "Tool executed");
                Ok(output)
            }
            Err(ChatError::ToolExecutionFailed(cause)) => {
                tracing::warn!(tool = name, error = %cause, "Tool execution failed");
                Err(ChatError::ToolExecutionFailed(cause))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo the text field".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        fn validate(&self, input: &ToolInput) -> Result<(), ChatError> {
            match input.get("text") {
                Some(Value::String(_)) => Ok(()),
                _ => Err(ChatError::InvalidToolInput("text must be a string".to_string())),
            }
        }

        async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ChatError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput(vec![input["text"].clone()]))
        }
    }

    fn registry() -> (Arc<EchoTool>, ToolRegistry) {
        let tool = Arc::new(EchoTool {
            runs: AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        (tool, registry)
    }

    fn input(value: Value) -> ToolInput {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_execute_known_tool() {
        let (tool, registry) = registry();
        assert!(registry.knows("echo"));
        let out = registry
            .execute("echo", &input(serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(serde_json::to_string(&out).unwrap(), r#"["hi"]"#);
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_revalidates_input() {
        let (tool, registry) = registry();
        let err = registry
            .execute("echo", &input(serde_json::json!({"text": 5})))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidToolInput(_)));
        assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (_tool, registry) = registry();
        assert!(!registry.knows("nope"));
        let err = registry.execute("nope", &ToolInput::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidToolInput(_)));
    }

    #[test]
    fn test_catalog_is_sorted() {
        let (_tool, registry) = registry();
        let names: Vec<String> = registry.catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo"]);
    }
}
