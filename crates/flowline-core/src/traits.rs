use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::spec::GraphSpec;
use crate::types::*;

/// Opaque collaborator that runs one agent node.
///
/// Given the node's instruction, conversation and tool catalog, returns a
/// structured result or a typed failure. Tool calls, retries and provider
/// details all live behind this boundary.
pub trait ModelClient: Send + Sync + 'static {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelOutput>>;
}

/// A callable with a schema, exposed to agent nodes.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Tool catalog lookup by name.
pub trait ToolCatalog: Send + Sync {
    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>>;

    fn names(&self) -> Vec<String>;

    fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tool(name).map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
    }
}

/// Deterministic, catalog-registered operation backing a function node.
pub trait Function: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn call(&self, input: Payload) -> BoxFuture<'_, Result<Payload>>;
}

/// Function lookup by reference name.
pub trait FunctionCatalog: Send + Sync {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>>;

    fn names(&self) -> Vec<String>;
}

/// Read access to stored graph specs.
pub trait SpecSource: Send + Sync + 'static {
    fn load(&self, graph_id: &str) -> BoxFuture<'_, Result<GraphSpec>>;
}
