//! Tool System Module
//!
//! Structured tool calling for agents. Tools are the only way an agent
//! touches the outside world; every invocation becomes an ActionStep on
//! the current trajectory.

pub mod benchmark;
pub mod sandbox;
pub mod vendor;

pub use benchmark::{BenchmarkCapability, BenchmarkResult, StaticBenchmark};
pub use sandbox::{
    ProcessSandbox, SandboxCapability, SandboxRequest, SandboxResult, ScriptedSandbox,
};
pub use vendor::{StaticVendorCache, VendorCache, VendorCapabilities};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Output from a tool execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    /// Whether the tool execution was successful
    pub success: bool,
    /// The output data (can be string, JSON object, etc.)
    pub data: Value,
    /// Human-readable summary of the output
    pub summary: String,
    /// Optional error message if success is false
    pub error: Option<String>,
}

impl ToolOutput {
    /// Create a successful output
    pub fn success(data: impl Into<Value>, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            summary: summary.into(),
            error: None,
        }
    }

    /// Create a successful output with string data
    pub fn success_str(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            success: true,
            summary: content.clone(),
            data: Value::String(content),
            error: None,
        }
    }

    /// Create a failed output
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: Value::Null,
            summary: format!("Error: {}", error),
            error: Some(error),
        }
    }
}

/// A tool call request parsed from LLM output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Name of the tool to call
    pub name: String,
    /// Parameters for the tool
    pub parameters: Value,
}

/// Trait for tools that can be executed by agents
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool
    fn name(&self) -> String;

    /// One-line description shown to the model
    fn description(&self) -> String;

    /// Execute with the given parameters
    async fn execute(&self, parameters: Value) -> ToolOutput;
}

/// Registry of available tools, filtered per agent by tool_set.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a tool by call, reporting an unknown tool as a failure
    /// output rather than an error.
    pub async fn invoke(&self, call: &ToolCall) -> ToolOutput {
        match self.get(&call.name) {
            Some(tool) => tool.execute(call.parameters.clone()).await,
            None => ToolOutput::failure(format!("unknown tool: {}", call.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> String {
            "echo".to_string()
        }

        fn description(&self) -> String {
            "Echo the input back".to_string()
        }

        async fn execute(&self, parameters: Value) -> ToolOutput {
            ToolOutput::success(parameters, "echoed")
        }
    }

    #[tokio::test]
    async fn test_registry_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let output = registry
            .invoke(&ToolCall {
                name: "echo".to_string(),
                parameters: serde_json::json!({"msg": "hi"}),
            })
            .await;
        assert!(output.success);
        assert_eq!(output.data["msg"], "hi");

        let missing = registry
            .invoke(&ToolCall {
                name: "nope".to_string(),
                parameters: Value::Null,
            })
            .await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("unknown tool"));
    }
}
