use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowlineError {
    // Compile errors
    #[error("graph validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Spec parse error: {0}")]
    SpecParse(String),

    // Node runtime errors
    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Node '{node}' timed out after {timeout_secs}s")]
    NodeTimeout { node: String, timeout_secs: u64 },

    // Collaborator errors
    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("Model response parse error: {0}")]
    ModelParse(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function execution failed: {function}: {message}")]
    FunctionExecution { function: String, message: String },

    #[error("Graph not found in spec source: {0}")]
    SpecNotFound(String),

    // Engine errors
    #[error("Execution timed out after {0}s")]
    ExecutionTimeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution already exists: {0}")]
    DuplicateExecution(String),

    // Event log errors
    #[error("Event log already exists: {0}")]
    DuplicateEventLog(String),

    #[error("Event log error: {0}")]
    EventLog(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowlineError>;

/// A single reason a graph spec was rejected by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    DuplicateNode { name: String },
    UnknownEdgeSource { from: String, to: String },
    UnknownEdgeTarget { from: String, to: String },
    MissingEntryPoint,
    UnknownEntryPoint { entry_point: String },
    UnknownTool { node: String, tool: String },
    UnknownFunction { node: String, function_ref: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { name } => write!(f, "duplicate node name '{}'", name),
            Self::UnknownEdgeSource { from, to } => {
                write!(f, "edge {} -> {} references unknown source '{}'", from, to, from)
            }
            Self::UnknownEdgeTarget { from, to } => {
                write!(f, "edge {} -> {} references unknown target '{}'", from, to, to)
            }
            Self::MissingEntryPoint => write!(f, "entry point is missing"),
            Self::UnknownEntryPoint { entry_point } => {
                write!(f, "entry point '{}' is not a node", entry_point)
            }
            Self::UnknownTool { node, tool } => {
                write!(f, "node '{}' references unknown tool '{}'", node, tool)
            }
            Self::UnknownFunction { node, function_ref } => {
                write!(f, "node '{}' references unknown function '{}'", node, function_ref)
            }
        }
    }
}

/// Every issue found while compiling one spec. Warnings never cause rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}
