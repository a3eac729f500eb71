use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EventId, NodeStatus};

/// Why an execution ended. Carried by the final `Done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    Completed,
    Cancel,
    Error,
}

/// Closed set of lifecycle events an execution can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// Run begins. Always first.
    Start { execution_id: String },
    NodeStart { node_id: String },
    NodeStop {
        node_id: String,
        status: NodeStatus,
        /// Structured payload, or the raw text when the node produced none.
        result: serde_json::Value,
    },
    /// Control passes from the nodes that just completed to the ones they activated.
    Handoff {
        from_node_ids: Vec<String>,
        to_node_ids: Vec<String>,
    },
    /// Aggregate across terminal nodes.
    Result {
        status: String,
        results: serde_json::Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_nodes: Vec<String>,
    },
    Cancel { reason: String },
    Error { reason: String },
    /// Always last.
    Done { execution_id: String, reason: DoneReason },
    /// Transport keepalive. Never affects completion.
    Ping { timestamp: i64 },
}

impl EventKind {
    /// Wire name, used as the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::NodeStart { .. } => "node_start",
            Self::NodeStop { .. } => "node_stop",
            Self::Handoff { .. } => "handoff",
            Self::Result { .. } => "result",
            Self::Cancel { .. } => "cancel",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
            Self::Ping { .. } => "ping",
        }
    }

    /// Payload without the type tag, used as the SSE `data:` field.
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut obj)) => {
                obj.remove("data").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }

    /// Rebuild an event from its wire type and payload.
    pub fn from_parts(event_type: &str, data: serde_json::Value) -> Result<Self> {
        let tagged = serde_json::json!({ "type": event_type, "data": data });
        Ok(serde_json::from_value(tagged)?)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping { .. })
    }
}

/// An event as stored in the log and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn new(id: EventId, kind: EventKind) -> Self {
        Self { id, kind }
    }

    pub fn is_done(&self) -> bool {
        self.kind.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let done = EventKind::Done {
            execution_id: "x".into(),
            reason: DoneReason::Cancel,
        };
        assert_eq!(done.event_type(), "done");
        assert!(done.is_done());
        assert_eq!(EventKind::Ping { timestamp: 1 }.event_type(), "ping");
        assert_eq!(
            EventKind::Handoff {
                from_node_ids: vec![],
                to_node_ids: vec![]
            }
            .event_type(),
            "handoff"
        );
    }

    #[test]
    fn test_data_strips_tag() {
        let ev = EventKind::NodeStop {
            node_id: "a".into(),
            status: NodeStatus::Completed,
            result: serde_json::json!({"k": 1}),
        };
        assert_eq!(
            ev.data(),
            serde_json::json!({"node_id": "a", "status": "completed", "result": {"k": 1}})
        );
    }

    #[test]
    fn test_from_parts_rebuilds_event() {
        let ev = EventKind::Done {
            execution_id: "e1".into(),
            reason: DoneReason::Error,
        };
        let rebuilt = EventKind::from_parts(ev.event_type(), ev.data()).unwrap();
        assert_eq!(rebuilt, ev);
        assert!(EventKind::from_parts("bogus", serde_json::json!({})).is_err());
    }
}
