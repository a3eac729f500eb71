use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use flowline_core::error::{FlowlineError, Result, ValidationIssue, ValidationReport};
use flowline_core::spec::{EdgeCondition, GraphSpec, NodeKind, NodeRole};
use flowline_core::traits::{FunctionCatalog, ToolCatalog};

use crate::condition::RuleSet;
use crate::graph::{
    AgentNode, CompiledEdge, CompiledGraph, CompiledKind, CompiledNode, FunctionNode, NodeIndex,
    RoutingStrategy, COMPLETION_INSTRUCTION,
};

/// Turns a `GraphSpec` into a `CompiledGraph`, or reports every reason it can't.
#[derive(Clone)]
pub struct GraphCompiler {
    tools: Arc<dyn ToolCatalog>,
    functions: Arc<dyn FunctionCatalog>,
}

impl GraphCompiler {
    pub fn new(tools: Arc<dyn ToolCatalog>, functions: Arc<dyn FunctionCatalog>) -> Self {
        Self { tools, functions }
    }

    /// Validate and compile. Fails with `FlowlineError::Validation` listing
    /// every issue found; warnings alone never fail.
    pub fn compile(&self, spec: &GraphSpec) -> Result<CompiledGraph> {
        let mut report = ValidationReport::default();

        // Node table. The first definition of a duplicated name wins the slot.
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let mut reported_dupes = HashSet::new();
        for node in &spec.nodes {
            if index.contains_key(&node.name) {
                if reported_dupes.insert(node.name.clone()) {
                    report.issues.push(ValidationIssue::DuplicateNode {
                        name: node.name.clone(),
                    });
                }
                continue;
            }
            index.insert(node.name.clone(), index.len());
        }

        if let Some(declared) = &spec.declared_nodes {
            check_declared_drift(declared, &index, &mut report.warnings);
        }

        let entry = if spec.entry_point.trim().is_empty() {
            report.issues.push(ValidationIssue::MissingEntryPoint);
            None
        } else {
            let found = index.get(&spec.entry_point).copied();
            if found.is_none() {
                report.issues.push(ValidationIssue::UnknownEntryPoint {
                    entry_point: spec.entry_point.clone(),
                });
            }
            found
        };

        let mut nodes = Vec::with_capacity(index.len());
        let mut seen = HashSet::new();
        for node in &spec.nodes {
            if !seen.insert(node.name.as_str()) {
                continue;
            }
            let kind = match &node.kind {
                NodeKind::Agent(agent) => {
                    let mut tools = Vec::with_capacity(agent.tools.len());
                    for tool in &agent.tools {
                        match self.tools.definition(tool) {
                            Some(def) => tools.push(def),
                            None => report.issues.push(ValidationIssue::UnknownTool {
                                node: node.name.clone(),
                                tool: tool.clone(),
                            }),
                        }
                    }
                    let mut instruction = agent.instruction.clone();
                    if matches!(agent.role, NodeRole::Router | NodeRole::Orchestrator) {
                        instruction.push_str(COMPLETION_INSTRUCTION);
                    }
                    CompiledKind::Agent(AgentNode {
                        model: agent.model.clone(),
                        instruction,
                        tools,
                        output_schema: agent.output_schema.clone(),
                    })
                }
                NodeKind::Function(func) => match self.functions.function(&func.function_ref) {
                    Some(function) => CompiledKind::Function(FunctionNode {
                        function_ref: func.function_ref.clone(),
                        function,
                    }),
                    None => {
                        report.issues.push(ValidationIssue::UnknownFunction {
                            node: node.name.clone(),
                            function_ref: func.function_ref.clone(),
                        });
                        continue;
                    }
                },
            };
            nodes.push(CompiledNode {
                name: node.name.clone(),
                role: node.role(),
                kind,
            });
        }

        let mut edges = Vec::with_capacity(spec.edges.len());
        for edge in &spec.edges {
            let from = index.get(&edge.from).copied();
            let to = index.get(&edge.to).copied();
            if from.is_none() {
                report.issues.push(ValidationIssue::UnknownEdgeSource {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            if to.is_none() {
                report.issues.push(ValidationIssue::UnknownEdgeTarget {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };

            let source_role = spec
                .nodes
                .iter()
                .find(|n| n.name == edge.from)
                .map(|n| n.role())
                .unwrap_or_default();

            let strategy = match &edge.condition {
                EdgeCondition::Expression { expr } => RoutingStrategy::Expression(expr.clone()),
                EdgeCondition::Rules { logic, rules } => {
                    RoutingStrategy::Rules(RuleSet::compile(*logic, rules))
                }
                EdgeCondition::None => match source_role {
                    NodeRole::Router | NodeRole::Orchestrator => RoutingStrategy::NextNode,
                    NodeRole::General => RoutingStrategy::Unconditional,
                },
            };

            if strategy.is_conditional()
                && source_role == NodeRole::Orchestrator
                && edge.to.eq_ignore_ascii_case("complete")
            {
                report.warnings.push(format!(
                    "orchestrator edge {} -> {} targets a node named like the completion signal and can never be routed to",
                    edge.from, edge.to
                ));
            }

            edges.push(CompiledEdge {
                from,
                to,
                from_name: edge.from.clone(),
                to_name: edge.to.clone(),
                strategy,
                honors_terminal_signal: source_role == NodeRole::Orchestrator,
            });
        }

        let result_nodes = spec
            .output_schema
            .as_ref()
            .and_then(|schema| schema.get("required"))
            .and_then(|req| req.as_array())
            .map(|req| {
                req.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|name| match index.get(name) {
                        Some(idx) => Some(*idx),
                        None => {
                            report.warnings.push(format!(
                                "output schema requires unknown node '{}'",
                                name
                            ));
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|req| !req.is_empty());

        for warning in &report.warnings {
            warn!(graph = %spec.name, "{}", warning);
        }

        if !report.is_valid() {
            warn!(graph = %spec.name, issues = report.issues.len(), "Graph spec rejected");
            return Err(FlowlineError::Validation(report));
        }
        let Some(entry) = entry else {
            return Err(FlowlineError::Validation(report));
        };

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        for (i, edge) in edges.iter().enumerate() {
            outgoing[edge.from].push(i);
            incoming[edge.to].push(i);
        }

        info!(
            graph = %spec.name,
            nodes = nodes.len(),
            edges = edges.len(),
            entry = %spec.entry_point,
            "Graph compiled"
        );

        Ok(CompiledGraph {
            name: spec.name.clone(),
            nodes,
            index,
            edges,
            outgoing,
            incoming,
            entry,
            reentry: spec.reentry,
            result_nodes,
            warnings: report.warnings,
        })
    }
}

fn check_declared_drift(
    declared: &[String],
    actual: &HashMap<String, NodeIndex>,
    warnings: &mut Vec<String>,
) {
    let declared: HashSet<&str> = declared.iter().map(String::as_str).collect();
    let mut missing: Vec<&str> = actual
        .keys()
        .map(String::as_str)
        .filter(|n| !declared.contains(n))
        .collect();
    let mut extra: Vec<&str> = declared
        .iter()
        .copied()
        .filter(|n| !actual.contains_key(*n))
        .collect();
    missing.sort_unstable();
    extra.sort_unstable();

    if !missing.is_empty() {
        warnings.push(format!("declared node list is missing: {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        warnings.push(format!("declared node list has undefined nodes: {}", extra.join(", ")));
    }
}
