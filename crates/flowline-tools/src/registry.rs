use std::collections::HashMap;
use std::sync::Arc;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::traits::{Function, FunctionCatalog, Tool, ToolCatalog};
use flowline_core::types::{Payload, ToolDefinition};

/// Registry of tools agents may call.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get tool definitions for sending to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter_map(|name| ToolCatalog::definition(self, name))
            .collect()
    }

    /// Execute a tool by name, bounded by its own timeout.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlowlineError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(FlowlineError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with the built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::data::JsonQueryTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCatalog for ToolRegistry {
    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.get(name)
    }

    fn names(&self) -> Vec<String> {
        self.list().into_iter().map(String::from).collect()
    }
}

/// Registry of deterministic functions that back function nodes.
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register(&mut self, function: impl Function) {
        let name = function.name().to_string();
        self.functions.insert(name, Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Call a function by reference name.
    pub async fn call(&self, name: &str, input: Payload) -> Result<Payload> {
        let function = self
            .get(name)
            .ok_or_else(|| FlowlineError::FunctionNotFound(name.to_string()))?;
        function.call(input).await
    }

    /// Create a registry with `echo_function` and `merge_inputs` registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::functions::EchoFunction);
        registry.register(crate::builtin::functions::MergeInputsFunction);
        registry
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionCatalog for FunctionRegistry {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.get(name)
    }

    fn names(&self) -> Vec<String> {
        self.list().into_iter().map(String::from).collect()
    }
}
