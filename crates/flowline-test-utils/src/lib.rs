//! Mocks and fixtures shared by Flowline's test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::spec::{EdgeSpec, GraphSpec, NodeRole, NodeSpec, ReentryPolicy, Rule, RuleLogic};
use flowline_core::traits::{ModelClient, SpecSource};
use flowline_core::types::{ModelOutput, ModelRequest, Payload};

/// One scripted reply for an agent node.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(ModelOutput),
    Fail(String),
    /// Sleep, then reply.
    Delay(Duration, ModelOutput),
    /// Never return.
    Hang,
}

impl Step {
    pub fn json(value: Value) -> Self {
        Self::Reply(ModelOutput::structured(payload(value)))
    }

    pub fn text(text: &str) -> Self {
        Self::Reply(ModelOutput::text(text))
    }

    pub fn delayed_json(delay: Duration, value: Value) -> Self {
        Self::Delay(delay, ModelOutput::structured(payload(value)))
    }
}

/// `ModelClient` that answers from per-node queues and records every request.
///
/// A node with an empty queue gets the default reply, which is the text
/// `"<node> done"` unless overridden.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Mutex<Option<ModelOutput>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next invocation of `node`.
    pub fn on(self, node: &str, step: Step) -> Self {
        self.push(node, step);
        self
    }

    pub fn push(&self, node: &str, step: Step) {
        self.scripts
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn with_default(self, output: ModelOutput) -> Self {
        *self.fallback.lock().unwrap() = Some(output);
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Nodes invoked, in invocation order.
    pub fn invoked(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn calls(&self, node: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.node == node)
            .count()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelOutput>> {
        let node = request.node.clone();
        self.requests.lock().unwrap().push(request);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&node)
            .and_then(|q| q.pop_front());
        let fallback = self.fallback.lock().unwrap().clone();

        Box::pin(async move {
            match step {
                Some(Step::Reply(out)) => Ok(out),
                Some(Step::Fail(message)) => Err(FlowlineError::ModelInvocation(message)),
                Some(Step::Delay(delay, out)) => {
                    tokio::time::sleep(delay).await;
                    Ok(out)
                }
                Some(Step::Hang) => futures::future::pending().await,
                None => Ok(fallback.unwrap_or_else(|| ModelOutput::text(format!("{} done", node)))),
            }
        })
    }
}

/// `SpecSource` over a fixed map of graph id to spec.
#[derive(Default)]
pub struct StaticSpecSource {
    specs: HashMap<String, GraphSpec>,
}

impl StaticSpecSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, graph_id: &str, spec: GraphSpec) -> Self {
        self.specs.insert(graph_id.to_string(), spec);
        self
    }
}

impl SpecSource for StaticSpecSource {
    fn load(&self, graph_id: &str) -> BoxFuture<'_, Result<GraphSpec>> {
        let found = self.specs.get(graph_id).cloned();
        let graph_id = graph_id.to_string();
        Box::pin(async move { found.ok_or(FlowlineError::SpecNotFound(graph_id)) })
    }
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Spec builders for the recurring test graphs.
pub mod fixtures {
    use super::*;

    pub fn agent(name: &str) -> NodeSpec {
        NodeSpec::agent(name, "test-model", format!("You are {}.", name))
    }

    /// `A -> B -> C`, all unconditional.
    pub fn linear() -> GraphSpec {
        GraphSpec::new("linear", "A", ReentryPolicy::RunOnce)
            .with_node(agent("A"))
            .with_node(agent("B"))
            .with_node(agent("C"))
            .with_edge(EdgeSpec::new("A", "B"))
            .with_edge(EdgeSpec::new("B", "C"))
    }

    /// Router `R` choosing between `B` and `C` through `next_node`.
    pub fn router() -> GraphSpec {
        GraphSpec::new("router", "R", ReentryPolicy::RunOnce)
            .with_node(agent("R").with_role(NodeRole::Router))
            .with_node(agent("B"))
            .with_node(agent("C"))
            .with_edge(EdgeSpec::new("R", "B"))
            .with_edge(EdgeSpec::new("R", "C"))
    }

    /// `S` fans out to `X` when `score >= 0.5` and to `Y` when `score < 0.5`.
    pub fn score_split() -> GraphSpec {
        GraphSpec::new("score_split", "S", ReentryPolicy::RunOnce)
            .with_node(agent("S"))
            .with_node(agent("X"))
            .with_node(agent("Y"))
            .with_edge(EdgeSpec::rules(
                "S",
                "X",
                RuleLogic::And,
                vec![Rule::new("score", ">=", serde_json::json!(0.5))],
            ))
            .with_edge(EdgeSpec::rules(
                "S",
                "Y",
                RuleLogic::And,
                vec![Rule::new("score", "<", serde_json::json!(0.5))],
            ))
    }

    /// Orchestrator `O` delegating to `W`, which reports back to `O`.
    pub fn orchestrator(reentry: ReentryPolicy) -> GraphSpec {
        GraphSpec::new("orchestrated", "O", reentry)
            .with_node(agent("O").with_role(NodeRole::Orchestrator))
            .with_node(agent("W"))
            .with_edge(EdgeSpec::new("O", "W"))
            .with_edge(EdgeSpec::new("W", "O"))
    }

    /// `A` fans out to `B` and `C`, which both feed `D`.
    pub fn diamond(reentry: ReentryPolicy) -> GraphSpec {
        GraphSpec::new("diamond", "A", reentry)
            .with_node(agent("A"))
            .with_node(agent("B"))
            .with_node(agent("C"))
            .with_node(agent("D"))
            .with_edge(EdgeSpec::new("A", "B"))
            .with_edge(EdgeSpec::new("A", "C"))
            .with_edge(EdgeSpec::new("B", "D"))
            .with_edge(EdgeSpec::new("C", "D"))
    }
}
