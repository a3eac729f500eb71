//! Graph compilation and conditional routing.
//!
//! `GraphCompiler` validates a `GraphSpec` against the tool and function
//! catalogs and produces a `CompiledGraph`: a node table, the edge list with
//! one precomputed `RoutingStrategy` per edge, and the entry point.
//! Edge conditions are evaluated by `CompiledEdge::evaluate`, which is pure
//! and never fails.

pub mod compiler;
pub mod condition;
pub mod expression;
pub mod graph;

pub use compiler::GraphCompiler;
pub use condition::{Diagnostics, Operator, RuleSet};
pub use graph::{
    AgentNode, CompiledEdge, CompiledGraph, CompiledKind, CompiledNode, FunctionNode, NodeIndex,
    RouteSignal, RoutingStrategy,
};
