use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use flowline_core::spec::{NodeRole, ReentryPolicy};
use flowline_core::traits::Function;
use flowline_core::types::{Payload, ToolDefinition};

use crate::condition::{Diagnostics, RuleSet};
use crate::expression;

/// Position of a node in the compiled node table.
pub type NodeIndex = usize;

/// Field routers and orchestrators use to name their successor.
pub const NEXT_NODE_FIELD: &str = "next_node";

/// Appended to the instruction of every router and orchestrator agent.
pub const COMPLETION_INSTRUCTION: &str = "\n\nIMPORTANT: When you determine that the workflow is complete \
and all necessary agents have been executed, output {\"next_node\": \"COMPLETE\"} to signal completion. \
Otherwise, continue routing to the appropriate next agent.";

/// What a routing node asked for, read from its `next_node` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSignal {
    /// Continue with the named node.
    Next(String),
    /// The workflow is finished; no outgoing edge should fire.
    Complete,
    /// No usable `next_node` value.
    Absent,
}

impl RouteSignal {
    pub fn read(output: &Payload) -> Self {
        match output.get(NEXT_NODE_FIELD) {
            Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("complete") => Self::Complete,
            Some(Value::String(s)) if !s.is_empty() => Self::Next(s.clone()),
            _ => Self::Absent,
        }
    }
}

/// How one edge decides whether to fire. Resolved once, at compile time.
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    /// Fires as soon as the source completes.
    Unconditional,
    Rules(RuleSet),
    Expression(Value),
    /// Fires when the source's `next_node` is exactly this edge's target.
    NextNode,
}

impl RoutingStrategy {
    pub fn is_conditional(&self) -> bool {
        !matches!(self, Self::Unconditional)
    }
}

/// An edge with its condition precompiled.
#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub from_name: String,
    pub to_name: String,
    pub strategy: RoutingStrategy,
    /// Source is an orchestrator: the terminal signal blocks this edge,
    /// whatever its strategy.
    pub honors_terminal_signal: bool,
}

impl CompiledEdge {
    /// Decide whether the edge fires given the source's structured output.
    ///
    /// Pure and total. Conditional edges out of a node that produced only
    /// raw text never fire.
    pub fn evaluate(&self, structured: Option<&Payload>, diags: &mut Diagnostics) -> bool {
        if !self.strategy.is_conditional() {
            return true;
        }
        let Some(output) = structured else {
            diags.push(format!(
                "node '{}' produced no structured output; edge {} -> {} cannot be evaluated",
                self.from_name, self.from_name, self.to_name
            ));
            return false;
        };

        if self.honors_terminal_signal && RouteSignal::read(output) == RouteSignal::Complete {
            info!(
                from = %self.from_name,
                to = %self.to_name,
                "Orchestrator signalled completion, edge blocked"
            );
            return false;
        }

        let fired = match &self.strategy {
            RoutingStrategy::Unconditional => true,
            RoutingStrategy::Rules(rules) => rules.evaluate(output, diags),
            RoutingStrategy::Expression(expr) => expression::evaluate_condition(expr, output, diags),
            // Exact name match. Only orchestrators give `COMPLETE` a meaning.
            RoutingStrategy::NextNode => match output.get(NEXT_NODE_FIELD) {
                Some(Value::String(target)) if !target.is_empty() => *target == self.to_name,
                _ => {
                    diags.push(format!(
                        "node '{}' output has no '{}' field",
                        self.from_name, NEXT_NODE_FIELD
                    ));
                    false
                }
            },
        };
        if fired {
            debug!(from = %self.from_name, to = %self.to_name, "Edge condition matched");
        }
        fired
    }
}

/// A model-backed node ready to run.
#[derive(Debug, Clone)]
pub struct AgentNode {
    pub model: String,
    /// Instruction as sent to the model, including any routing addendum.
    pub instruction: String,
    pub tools: Vec<ToolDefinition>,
    pub output_schema: Option<Value>,
}

/// A deterministic node bound to its catalog entry.
#[derive(Clone)]
pub struct FunctionNode {
    pub function_ref: String,
    pub function: Arc<dyn Function>,
}

impl fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionNode")
            .field("function_ref", &self.function_ref)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum CompiledKind {
    Agent(AgentNode),
    Function(FunctionNode),
}

#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub name: String,
    pub role: NodeRole,
    pub kind: CompiledKind,
}

/// Output of the compiler. Immutable and shareable across runs.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<CompiledNode>,
    pub(crate) index: HashMap<String, NodeIndex>,
    pub(crate) edges: Vec<CompiledEdge>,
    pub(crate) outgoing: Vec<Vec<usize>>,
    pub(crate) incoming: Vec<Vec<usize>>,
    pub(crate) entry: NodeIndex,
    pub(crate) reentry: ReentryPolicy,
    pub(crate) result_nodes: Option<Vec<NodeIndex>>,
    pub(crate) warnings: Vec<String>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: NodeIndex) -> &CompiledNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn edges(&self) -> &[CompiledEdge] {
        &self.edges
    }

    /// Outgoing edges of `idx`, in declaration order.
    pub fn outgoing(&self, idx: NodeIndex) -> impl Iterator<Item = &CompiledEdge> {
        self.outgoing[idx].iter().map(move |e| &self.edges[*e])
    }

    /// Distinct predecessors of `idx`, in declaration order of their edges.
    pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = Vec::new();
        for e in &self.incoming[idx] {
            let from = self.edges[*e].from;
            if !seen.contains(&from) {
                seen.push(from);
            }
        }
        seen
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn reentry(&self) -> ReentryPolicy {
        self.reentry
    }

    /// Nodes listed in the output schema's `required`, if any.
    pub fn result_nodes(&self) -> Option<&[NodeIndex]> {
        self.result_nodes.as_deref()
    }

    /// Non-fatal findings from compilation.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::spec::{Rule, RuleLogic};
    use serde_json::json;

    fn edge(strategy: RoutingStrategy, orchestrator: bool) -> CompiledEdge {
        CompiledEdge {
            from: 0,
            to: 1,
            from_name: "R".into(),
            to_name: "C".into(),
            strategy,
            honors_terminal_signal: orchestrator,
        }
    }

    fn out(v: Value) -> Payload {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_route_signal() {
        assert_eq!(RouteSignal::read(&out(json!({"next_node": "C"}))), RouteSignal::Next("C".into()));
        assert_eq!(RouteSignal::read(&out(json!({"next_node": "Complete"}))), RouteSignal::Complete);
        assert_eq!(RouteSignal::read(&out(json!({"next_node": ""}))), RouteSignal::Absent);
        assert_eq!(RouteSignal::read(&out(json!({"next_node": 3}))), RouteSignal::Absent);
        assert_eq!(RouteSignal::read(&out(json!({}))), RouteSignal::Absent);
    }

    #[test]
    fn test_unconditional_fires_without_structured_output() {
        let mut diags = Diagnostics::new();
        assert!(edge(RoutingStrategy::Unconditional, false).evaluate(None, &mut diags));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_conditional_without_structured_output_is_false() {
        let mut diags = Diagnostics::new();
        assert!(!edge(RoutingStrategy::NextNode, false).evaluate(None, &mut diags));
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_next_node_matches_target() {
        let mut diags = Diagnostics::new();
        let e = edge(RoutingStrategy::NextNode, false);
        assert!(e.evaluate(Some(&out(json!({"next_node": "C"}))), &mut diags));
        assert!(!e.evaluate(Some(&out(json!({"next_node": "B"}))), &mut diags));
        assert!(diags.is_empty());
        assert!(!e.evaluate(Some(&out(json!({"other": 1}))), &mut diags));
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_router_can_route_to_node_named_complete() {
        let mut e = edge(RoutingStrategy::NextNode, false);
        e.to_name = "Complete".into();
        let mut diags = Diagnostics::new();
        assert!(e.evaluate(Some(&out(json!({"next_node": "Complete"}))), &mut diags));
        assert!(!e.evaluate(Some(&out(json!({"next_node": "COMPLETE"}))), &mut diags));

        e.honors_terminal_signal = true;
        assert!(!e.evaluate(Some(&out(json!({"next_node": "Complete"}))), &mut diags));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_terminal_signal_overrides_explicit_condition() {
        let rules = RuleSet::compile(RuleLogic::And, &[Rule::new("score", ">", json!(0))]);
        let output = out(json!({"next_node": "complete", "score": 5}));
        let mut diags = Diagnostics::new();

        assert!(!edge(RoutingStrategy::Rules(rules.clone()), true).evaluate(Some(&output), &mut diags));
        // Without the orchestrator flag the rules decide.
        assert!(edge(RoutingStrategy::Rules(rules), false).evaluate(Some(&output), &mut diags));
        assert!(!edge(RoutingStrategy::Expression(json!(true)), true).evaluate(Some(&output), &mut diags));
    }
}
