use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowline_core::config::{EngineConfig, FailurePolicy};
use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::EventKind;
use flowline_core::spec::ReentryPolicy;
use flowline_core::traits::ModelClient;
use flowline_core::types::{ChatMessage, ExecutionId, ExecutionStatus, ModelRequest, NodeStatus, Payload};
use flowline_graph::{CompiledGraph, CompiledKind, Diagnostics, NodeIndex};

use crate::emitter::EmitHandle;
use crate::handoff;
use crate::state::{ExecutionState, NodeOutput};

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Drives compiled graphs. One instance can serve many runs concurrently;
/// each run owns its own `ExecutionState`.
pub struct ExecutionEngine {
    model: Arc<dyn ModelClient>,
    config: EngineConfig,
}

/// Message from a node task to the engine loop.
struct Completion {
    node: NodeIndex,
    seq: u64,
    outcome: Result<NodeOutput>,
    elapsed_ms: u64,
}

impl ExecutionEngine {
    pub fn new(model: Arc<dyn ModelClient>, config: EngineConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `graph` to completion, emitting lifecycle events through `events`.
    ///
    /// Emits everything between `Start` and `Done`: node events, handoffs,
    /// and `Result` on success or `Cancel` on cancellation. Failures are
    /// returned as `Err` without an `Error` event; the caller reports them.
    pub async fn run(
        &self,
        graph: Arc<CompiledGraph>,
        execution_id: ExecutionId,
        input: Payload,
        events: EmitHandle,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut run = Run {
            engine: self,
            state: ExecutionState::new(graph.len()),
            graph,
            execution_id,
            input: Arc::new(input),
            events,
            cancel,
            tasks: JoinSet::new(),
            tx,
            rx,
        };
        let outcome = run.drive().await;
        run.tasks.abort_all();
        match &outcome {
            Ok(RunOutcome::Completed) => run.state.finish(ExecutionStatus::Completed),
            Ok(RunOutcome::Cancelled) => run.state.finish(ExecutionStatus::Cancelled),
            Err(_) => run.state.finish(ExecutionStatus::Failed),
        }
        info!(
            execution_id = %run.execution_id,
            status = ?run.state.status(),
            "Execution finished"
        );
        outcome
    }
}

struct Run<'a> {
    engine: &'a ExecutionEngine,
    graph: Arc<CompiledGraph>,
    state: ExecutionState,
    execution_id: ExecutionId,
    input: Arc<Payload>,
    events: EmitHandle,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<RunOutcome> {
        let timeout_secs = self.engine.config.execution_timeout_secs;
        let deadline = async move {
            if timeout_secs == 0 {
                futures::future::pending::<()>().await;
            } else {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            }
        };
        tokio::pin!(deadline);

        info!(
            execution_id = %self.execution_id,
            graph = %self.graph.name(),
            nodes = self.graph.len(),
            "Execution started"
        );

        let entry = self.graph.entry();
        if self.activate(entry) && self.start_all(vec![entry]) {
            return Ok(self.cancelled());
        }

        while self.state.running() > 0 {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.cancelled()),
                _ = &mut deadline => {
                    error!(execution_id = %self.execution_id, timeout_secs, "Execution deadline exceeded");
                    return Err(FlowlineError::ExecutionTimeout(timeout_secs));
                }
                Some(first) = self.rx.recv() => {
                    // Everything already queued is one batch, handled in activation order.
                    let mut batch = vec![first];
                    while let Ok(next) = self.rx.try_recv() {
                        batch.push(next);
                    }
                    batch.sort_by_key(|c| c.seq);
                    let to_start = self.handle_batch(batch)?;
                    if self.start_all(to_start) {
                        return Ok(self.cancelled());
                    }
                }
            }
        }

        self.emit_result();
        Ok(RunOutcome::Completed)
    }

    /// Process completions, emit `NodeStop`s and at most one `Handoff`.
    /// Returns the nodes to start next, in order.
    fn handle_batch(&mut self, batch: Vec<Completion>) -> Result<Vec<NodeIndex>> {
        let mut from_ids: Vec<String> = Vec::new();
        let mut to_start: Vec<NodeIndex> = Vec::new();

        for completion in batch {
            let node = completion.node;
            let name = self.graph.node(node).name.clone();

            match completion.outcome {
                Ok(output) => {
                    debug!(node = %name, elapsed_ms = completion.elapsed_ms, "Node completed");
                    self.events.emit(EventKind::NodeStop {
                        node_id: name.clone(),
                        status: NodeStatus::Completed,
                        result: output.to_value(),
                    });

                    let mut diags = Diagnostics::new();
                    let mut fired_any = false;
                    let graph = Arc::clone(&self.graph);
                    for edge in graph.outgoing(node) {
                        if !edge.evaluate(output.structured.as_ref(), &mut diags) {
                            continue;
                        }
                        fired_any = true;
                        let inbound = &mut self.state.slot_mut(edge.to).inbound;
                        if !inbound.contains(&node) {
                            inbound.push(node);
                        }
                        if !to_start.contains(&edge.to) && self.activate(edge.to) {
                            to_start.push(edge.to);
                            if !from_ids.contains(&name) {
                                from_ids.push(name.clone());
                            }
                        }
                    }
                    self.state.complete(node, output, completion.elapsed_ms);
                    self.state.slot_mut(node).fired = fired_any;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(node = %name, error = %message, "Node failed");
                    self.events.emit(EventKind::NodeStop {
                        node_id: name.clone(),
                        status: NodeStatus::Failed,
                        result: serde_json::json!({ "error": message }),
                    });
                    self.state.fail(node, message.clone(), completion.elapsed_ms);

                    let fatal = matches!(e, FlowlineError::NodeTimeout { .. })
                        || self.engine.config.failure_policy == FailurePolicy::AbortExecution;
                    if fatal {
                        return Err(match e {
                            FlowlineError::NodeTimeout { .. } | FlowlineError::NodeFailed { .. } => e,
                            _ => FlowlineError::NodeFailed { node: name, message },
                        });
                    }
                }
            }

            let slot = self.state.slot_mut(node);
            if slot.rerun_pending {
                slot.rerun_pending = false;
                if !to_start.contains(&node) && self.within_visit_limit(node) {
                    to_start.push(node);
                }
            }
        }

        if !to_start.is_empty() {
            let to_ids = to_start
                .iter()
                .map(|idx| self.graph.node(*idx).name.clone())
                .collect();
            self.events.emit(EventKind::Handoff {
                from_node_ids: from_ids,
                to_node_ids: to_ids,
            });
        }
        Ok(to_start)
    }

    /// Decide whether a node whose inbound edge fired should start.
    fn activate(&mut self, idx: NodeIndex) -> bool {
        let status = self.state.slot(idx).status;
        match self.graph.reentry() {
            ReentryPolicy::RunOnce => {
                if status != NodeStatus::Pending {
                    debug!(node = %self.graph.node(idx).name, "Already visited, activation ignored");
                    return false;
                }
                true
            }
            ReentryPolicy::ResetOnRevisit => {
                if !self.within_visit_limit(idx) {
                    return false;
                }
                if status == NodeStatus::Running {
                    self.state.slot_mut(idx).rerun_pending = true;
                    return false;
                }
                true
            }
        }
    }

    fn within_visit_limit(&self, idx: NodeIndex) -> bool {
        let visits = self.state.slot(idx).visits;
        let limit = self.engine.config.max_node_visits;
        if visits >= limit {
            warn!(
                node = %self.graph.node(idx).name,
                visits,
                limit,
                "Node visit limit reached, activation skipped"
            );
            return false;
        }
        true
    }

    /// Start nodes in order. Returns true if cancellation was observed first.
    fn start_all(&mut self, nodes: Vec<NodeIndex>) -> bool {
        for idx in nodes {
            if self.cancel.is_cancelled() {
                return true;
            }
            self.start(idx);
        }
        false
    }

    fn start(&mut self, idx: NodeIndex) {
        let (seq, inbound) = self.state.begin(idx);
        let node = self.graph.node(idx);
        let predecessors: Vec<(String, NodeOutput)> = inbound
            .into_iter()
            .filter_map(|p| {
                let output = self.state.slot(p).output.clone()?;
                Some((self.graph.node(p).name.clone(), output))
            })
            .collect();

        info!(execution_id = %self.execution_id, node = %node.name, seq, "Node started");
        self.events.emit(EventKind::NodeStart {
            node_id: node.name.clone(),
        });

        let task = NodeTask {
            graph: Arc::clone(&self.graph),
            node: idx,
            model: Arc::clone(&self.engine.model),
            execution_id: self.execution_id.clone(),
            input: Arc::clone(&self.input),
            predecessors,
            timeout_secs: self.engine.config.node_timeout_secs,
        };
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let name = task.graph.node(idx).name.clone();
            let outcome = match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(FlowlineError::NodeFailed {
                    node: name,
                    message: "node task panicked".into(),
                }),
            };
            let _ = tx.send(Completion {
                node: idx,
                seq,
                outcome,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        });
    }

    fn cancelled(&mut self) -> RunOutcome {
        self.tasks.abort_all();
        info!(execution_id = %self.execution_id, "Execution cancelled");
        self.events.emit(EventKind::Cancel {
            reason: "cancelled by request".into(),
        });
        RunOutcome::Cancelled
    }

    /// Aggregate terminal nodes, or the nodes the output schema requires.
    fn emit_result(&mut self) {
        let selected = match self.graph.result_nodes() {
            Some(required) => required.to_vec(),
            None => self.state.terminal_nodes(),
        };
        let mut results = serde_json::Map::new();
        for idx in selected {
            if let Some(output) = &self.state.slot(idx).output {
                results.insert(self.graph.node(idx).name.clone(), output.to_value());
            }
        }
        let failed_nodes: Vec<String> = self
            .state
            .failed()
            .iter()
            .map(|idx| self.graph.node(*idx).name.clone())
            .collect();
        let status = if failed_nodes.is_empty() { "completed" } else { "partial" };
        self.events.emit(EventKind::Result {
            status: status.into(),
            results,
            failed_nodes,
        });
    }
}

/// Everything a node needs to run away from the engine loop.
struct NodeTask {
    graph: Arc<CompiledGraph>,
    node: NodeIndex,
    model: Arc<dyn ModelClient>,
    execution_id: ExecutionId,
    input: Arc<Payload>,
    predecessors: Vec<(String, NodeOutput)>,
    timeout_secs: u64,
}

impl NodeTask {
    async fn run(self) -> Result<NodeOutput> {
        let name = self.graph.node(self.node).name.clone();
        let timeout_secs = self.timeout_secs;
        let work = self.execute();
        if timeout_secs == 0 {
            return work.await;
        }
        match tokio::time::timeout(Duration::from_secs(timeout_secs), work).await {
            Ok(result) => result,
            Err(_) => Err(FlowlineError::NodeTimeout {
                node: name,
                timeout_secs,
            }),
        }
    }

    async fn execute(self) -> Result<NodeOutput> {
        let node = self.graph.node(self.node);
        match &node.kind {
            CompiledKind::Agent(agent) => {
                let prompt = handoff::agent_prompt(&self.input, &self.predecessors);
                let request = ModelRequest {
                    execution_id: self.execution_id.clone(),
                    node: node.name.clone(),
                    model: agent.model.clone(),
                    instruction: agent.instruction.clone(),
                    messages: vec![ChatMessage::user(prompt)],
                    tools: agent.tools.clone(),
                    output_schema: agent.output_schema.clone(),
                };
                let output = self.model.invoke(request).await?;
                Ok(output.into())
            }
            CompiledKind::Function(function) => {
                let input = handoff::function_input(&self.input, &self.predecessors);
                let output = function.function.call(input).await?;
                Ok(NodeOutput::structured(output))
            }
        }
    }
}
