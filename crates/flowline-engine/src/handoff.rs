//! Input handed to a node from the run input and the nodes that activated it.

use serde_json::Value;

use flowline_core::types::Payload;

use crate::state::NodeOutput;

/// Keys checked, in order, for a plain-text task in the run input.
const TASK_KEYS: [&str; 3] = ["message", "task", "text"];

/// Render the run input as the task text an agent sees.
pub fn task_text(input: &Payload) -> String {
    for key in TASK_KEYS {
        if let Some(Value::String(s)) = input.get(key) {
            return s.clone();
        }
    }
    Value::Object(input.clone()).to_string()
}

/// Prompt for an agent node.
///
/// Without predecessors this is the task itself. Otherwise:
///
/// ```text
/// Original Task: <task>
///
/// Inputs from previous nodes:
///
/// From <node>:
///   - <node>: <output>
/// ```
pub fn agent_prompt(input: &Payload, predecessors: &[(String, NodeOutput)]) -> String {
    let task = task_text(input);
    if predecessors.is_empty() {
        return task;
    }

    let mut prompt = format!("Original Task: {}\n\nInputs from previous nodes:", task);
    for (name, output) in predecessors {
        let text = if output.text.is_empty() {
            "[no output]"
        } else {
            output.text.as_str()
        };
        prompt.push_str(&format!("\n\nFrom {}:\n  - {}: {}", name, name, text));
    }
    prompt
}

/// Input for a function node: predecessor payloads merged in activation
/// order (later keys win), or the run input when there are none.
pub fn function_input(input: &Payload, predecessors: &[(String, NodeOutput)]) -> Payload {
    if predecessors.is_empty() {
        return input.clone();
    }
    let mut merged = Payload::new();
    for (_, output) in predecessors {
        for (k, v) in output.as_payload() {
            merged.insert(k, v);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_task_text() {
        assert_eq!(task_text(&payload(json!({"message": "hello"}))), "hello");
        assert_eq!(task_text(&payload(json!({"n": 1}))), r#"{"n":1}"#);
    }

    #[test]
    fn test_agent_prompt_without_predecessors() {
        let input = payload(json!({"message": "do it"}));
        assert_eq!(agent_prompt(&input, &[]), "do it");
    }

    #[test]
    fn test_agent_prompt_with_predecessors() {
        let input = payload(json!({"message": "summarise"}));
        let preds = vec![
            ("reader".to_string(), NodeOutput::text("found 3 files")),
            ("empty".to_string(), NodeOutput::text("")),
        ];
        let prompt = agent_prompt(&input, &preds);
        assert!(prompt.starts_with("Original Task: summarise\n\nInputs from previous nodes:"));
        assert!(prompt.contains("From reader:\n  - reader: found 3 files"));
        assert!(prompt.contains("  - empty: [no output]"));
    }

    #[test]
    fn test_function_input_merges_in_order() {
        let input = payload(json!({"text": "run input"}));
        assert_eq!(function_input(&input, &[]), input);

        let preds = vec![
            ("a".to_string(), NodeOutput::structured(payload(json!({"x": 1, "y": 1})))),
            ("b".to_string(), NodeOutput::structured(payload(json!({"y": 2})))),
            ("c".to_string(), NodeOutput::text("raw")),
        ];
        let merged = function_input(&input, &preds);
        assert_eq!(Value::Object(merged), json!({"x": 1, "y": 2, "text": "raw"}));
    }
}
