//! Declarative workflow description, as submitted by callers.
//!
//! A `GraphSpec` is immutable input to the compiler. Nothing here is
//! validated: duplicate names, dangling edges and unknown entry points are
//! all representable and are reported by the compiler instead.

use serde::{Deserialize, Serialize};

use crate::error::{FlowlineError, Result};

/// Complete graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    /// Node names as declared by whoever generated the spec. Drift between
    /// this list and `nodes` is tolerated and only produces a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_nodes: Option<Vec<String>>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub entry_point: String,
    /// How a node reachable by more than one path behaves when activated again.
    pub reentry: ReentryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>, reentry: ReentryPolicy) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            declared_nodes: None,
            edges: vec![],
            entry_point: entry_point.into(),
            reentry,
            output_schema: None,
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| FlowlineError::SpecParse(e.to_string()))
    }

    /// Names of every node the spec actually defines, in declaration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }
}

/// Re-entrancy policy, chosen per graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryPolicy {
    /// A node runs at most once; later activations are no-ops.
    RunOnce,
    /// A node re-executes with fresh local state every time it is activated.
    ResetOnRevisit,
}

/// A node in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeSpec {
    pub fn agent(name: impl Into<String>, model: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Agent(AgentSpec {
                model: model.into(),
                instruction: instruction.into(),
                tools: vec![],
                output_schema: None,
                role: NodeRole::General,
            }),
        }
    }

    pub fn function(name: impl Into<String>, function_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Function(FunctionSpec {
                function_ref: function_ref.into(),
            }),
        }
    }

    /// Set the role. No effect on function nodes.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        if let NodeKind::Agent(ref mut agent) = self.kind {
            agent.role = role;
        }
        self
    }

    /// Set the tool names. No effect on function nodes.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        if let NodeKind::Agent(ref mut agent) = self.kind {
            agent.tools = tools;
        }
        self
    }

    pub fn role(&self) -> NodeRole {
        match &self.kind {
            NodeKind::Agent(agent) => agent.role,
            NodeKind::Function(_) => NodeRole::General,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Agent(AgentSpec),
    Function(FunctionSpec),
}

/// Model-backed node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub model: String,
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<String>,
    /// JSON Schema the structured result is expected to follow.
    #[serde(default, alias = "structured_output_schema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, alias = "category")]
    pub role: NodeRole,
}

/// Deterministic node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub function_ref: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    General,
    Router,
    Orchestrator,
}

/// A directed edge in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(alias = "from_node")]
    pub from: String,
    #[serde(alias = "to_node")]
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

impl EdgeSpec {
    /// An edge without explicit condition.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::None,
        }
    }

    pub fn rules(from: impl Into<String>, to: impl Into<String>, logic: RuleLogic, rules: Vec<Rule>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Rules { logic, rules },
        }
    }

    pub fn expression(from: impl Into<String>, to: impl Into<String>, expr: serde_json::Value) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Expression { expr },
        }
    }
}

/// Explicit condition attached to an edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    None,
    Rules {
        #[serde(default)]
        logic: RuleLogic,
        #[serde(default)]
        rules: Vec<Rule>,
    },
    /// JSONLogic-style expression tree, e.g. `{"==": [{"var": "score"}, 1]}`.
    Expression { expr: serde_json::Value },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLogic {
    #[default]
    And,
    Or,
}

/// One comparison over a field of the source node's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    /// Operator name. Unknown names are kept and evaluate to false.
    #[serde(alias = "op")]
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Rule {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}
