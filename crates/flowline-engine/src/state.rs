use serde_json::Value;

use flowline_core::types::{ExecutionStatus, ModelOutput, NodeStatus, Payload};
use flowline_graph::NodeIndex;

/// What a node produced: a structured payload, a raw text fallback, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub text: String,
    pub structured: Option<Payload>,
}

impl NodeOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }

    pub fn structured(payload: Payload) -> Self {
        Self {
            text: Value::Object(payload.clone()).to_string(),
            structured: Some(payload),
        }
    }

    /// Payload as carried by events: the structured object, else the text.
    pub fn to_value(&self) -> Value {
        match &self.structured {
            Some(payload) => Value::Object(payload.clone()),
            None => Value::String(self.text.clone()),
        }
    }

    /// Contribution to a merged function input.
    pub fn as_payload(&self) -> Payload {
        match &self.structured {
            Some(payload) => payload.clone(),
            None => {
                let mut p = Payload::new();
                p.insert("text".into(), Value::String(self.text.clone()));
                p
            }
        }
    }
}

impl From<ModelOutput> for NodeOutput {
    fn from(out: ModelOutput) -> Self {
        Self {
            text: out.text,
            structured: out.structured,
        }
    }
}

/// Per-node slot in the execution arena.
#[derive(Debug, Clone)]
pub struct NodeSlot {
    pub status: NodeStatus,
    /// Number of times the node was started.
    pub visits: u32,
    /// Scheduling order of the current (or last) activation.
    pub activation_seq: u64,
    pub output: Option<NodeOutput>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// At least one outgoing edge fired after the last completion.
    pub fired: bool,
    /// Activated again while running (reset-on-revisit only).
    pub rerun_pending: bool,
    /// Sources whose edges fired into this node since it last started.
    pub inbound: Vec<NodeIndex>,
}

impl Default for NodeSlot {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            visits: 0,
            activation_seq: 0,
            output: None,
            error: None,
            elapsed_ms: 0,
            fired: false,
            rerun_pending: false,
            inbound: Vec::new(),
        }
    }
}

/// State of one run. Owned and written by a single engine loop.
#[derive(Debug)]
pub struct ExecutionState {
    slots: Vec<NodeSlot>,
    status: ExecutionStatus,
    next_seq: u64,
    running: usize,
    failed: Vec<NodeIndex>,
}

impl ExecutionState {
    pub fn new(node_count: usize) -> Self {
        Self {
            slots: vec![NodeSlot::default(); node_count],
            status: ExecutionStatus::Running,
            next_seq: 0,
            running: 0,
            failed: Vec::new(),
        }
    }

    pub fn slot(&self, idx: NodeIndex) -> &NodeSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: NodeIndex) -> &mut NodeSlot {
        &mut self.slots[idx]
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Leave `Running`. Later calls are ignored so the transition happens once.
    pub fn finish(&mut self, status: ExecutionStatus) {
        if self.status == ExecutionStatus::Running {
            self.status = status;
        }
    }

    pub fn running(&self) -> usize {
        self.running
    }

    /// Mark a node started. Returns its activation sequence number and the
    /// sources that activated it.
    pub fn begin(&mut self, idx: NodeIndex) -> (u64, Vec<NodeIndex>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.running += 1;
        let slot = &mut self.slots[idx];
        slot.status = NodeStatus::Running;
        slot.visits += 1;
        slot.activation_seq = seq;
        slot.fired = false;
        slot.error = None;
        (seq, std::mem::take(&mut slot.inbound))
    }

    pub fn complete(&mut self, idx: NodeIndex, output: NodeOutput, elapsed_ms: u64) {
        self.running = self.running.saturating_sub(1);
        let slot = &mut self.slots[idx];
        slot.status = NodeStatus::Completed;
        slot.output = Some(output);
        slot.elapsed_ms = elapsed_ms;
    }

    pub fn fail(&mut self, idx: NodeIndex, error: String, elapsed_ms: u64) {
        self.running = self.running.saturating_sub(1);
        let slot = &mut self.slots[idx];
        slot.status = NodeStatus::Failed;
        slot.output = None;
        slot.error = Some(error);
        slot.elapsed_ms = elapsed_ms;
        if !self.failed.contains(&idx) {
            self.failed.push(idx);
        }
    }

    pub fn failed(&self) -> &[NodeIndex] {
        &self.failed
    }

    /// Completed nodes none of whose outgoing edges fired.
    pub fn terminal_nodes(&self) -> Vec<NodeIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == NodeStatus::Completed && !s.fired)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_values() {
        let text = NodeOutput::text("hi");
        assert_eq!(text.to_value(), json!("hi"));
        assert_eq!(text.as_payload().get("text"), Some(&json!("hi")));

        let mut p = Payload::new();
        p.insert("k".into(), json!(1));
        let structured = NodeOutput::structured(p.clone());
        assert_eq!(structured.to_value(), json!({"k": 1}));
        assert_eq!(structured.as_payload(), p);
    }

    #[test]
    fn test_lifecycle_bookkeeping() {
        let mut state = ExecutionState::new(3);
        state.slot_mut(1).inbound.push(0);
        let (seq0, inbound) = state.begin(1);
        assert_eq!(seq0, 0);
        assert_eq!(inbound, vec![0]);
        assert!(state.slot(1).inbound.is_empty());
        let (seq1, _) = state.begin(2);
        assert_eq!(seq1, 1);
        assert_eq!(state.running(), 2);

        state.complete(1, NodeOutput::text("a"), 5);
        state.fail(2, "boom".into(), 7);
        assert_eq!(state.running(), 0);
        assert_eq!(state.failed(), &[2]);
        assert_eq!(state.terminal_nodes(), vec![1]);

        state.slot_mut(1).fired = true;
        assert!(state.terminal_nodes().is_empty());
    }

    #[test]
    fn test_status_transitions_once() {
        let mut state = ExecutionState::new(0);
        state.finish(ExecutionStatus::Cancelled);
        state.finish(ExecutionStatus::Completed);
        assert_eq!(state.status(), ExecutionStatus::Cancelled);
    }
}
