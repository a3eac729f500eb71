//! Text wire format for the event stream.
//!
//! One block per event:
//!
//! ```text
//! id: <event id>
//! event: <type>
//! data: <json payload>
//!
//! ```

use crate::event::{EventKind, StreamEvent};
use crate::types::EventId;

/// Render one event as an SSE block, including the trailing blank line.
pub fn encode(event: &StreamEvent) -> String {
    format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id,
        event.kind.event_type(),
        event.kind.data()
    )
}

/// Parse a raw SSE byte stream into individual events.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE block.
#[derive(Debug, Clone)]
pub struct SseBlock {
    pub id: Option<String>,
    pub event_type: Option<String>,
    pub data: String,
}

impl SseBlock {
    /// Convert back into a typed event. `None` if any part is missing or malformed.
    pub fn into_event(self) -> Option<StreamEvent> {
        let id = EventId::parse(self.id.as_deref()?)?;
        let data: serde_json::Value = serde_json::from_str(&self.data).ok()?;
        let kind = EventKind::from_parts(self.event_type.as_deref()?, data).ok()?;
        Some(StreamEvent::new(id, kind))
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete blocks.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseBlock> {
        self.buffer.push_str(chunk);
        let mut blocks = Vec::new();

        // Split on double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();

            let mut id = None;
            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("id:") {
                    id = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                blocks.push(SseBlock {
                    id,
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DoneReason;

    #[test]
    fn test_encode_block_layout() {
        let ev = StreamEvent::new(
            EventId(3),
            EventKind::Error {
                reason: "boom".into(),
            },
        );
        assert_eq!(encode(&ev), "id: 3\nevent: error\ndata: {\"reason\":\"boom\"}\n\n");
    }

    #[test]
    fn test_parser_chunked() {
        let ev = StreamEvent::new(
            EventId(9),
            EventKind::Done {
                execution_id: "e".into(),
                reason: DoneReason::Completed,
            },
        );
        let wire = encode(&ev);
        let (head, tail) = wire.split_at(10);

        let mut parser = SseParser::new();
        assert!(parser.feed(head).is_empty());
        let blocks = parser.feed(tail);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id.as_deref(), Some("9"));
        assert_eq!(blocks.into_iter().next().unwrap().into_event(), Some(ev));
    }

    #[test]
    fn test_parser_multiple_blocks() {
        let mut parser = SseParser::new();
        let blocks = parser.feed("id: 1\nevent: ping\ndata: {\"timestamp\":1}\n\nid: 2\nevent: ping\ndata: {\"timestamp\":2}\n\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].event_type.as_deref(), Some("ping"));
    }
}
