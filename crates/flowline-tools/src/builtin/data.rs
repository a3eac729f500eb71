use futures::future::BoxFuture;
use serde::Deserialize;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::traits::Tool;

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    json: serde_json::Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'items[0].name')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value, or a string containing JSON" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input).map_err(|e| self.failure(e))?;
            let value = match p.json {
                serde_json::Value::String(raw) => {
                    serde_json::from_str(&raw).map_err(|e| self.failure(format!("Invalid JSON: {}", e)))?
                }
                other => other,
            };
            Ok(json_path_query(&value, &p.path))
        })
    }
}

impl JsonQueryTool {
    fn failure(&self, message: impl ToString) -> FlowlineError {
        FlowlineError::ToolExecution {
            tool: self.name().to_string(),
            message: message.to_string(),
        }
    }
}

/// Walk `path` (`a.b[2].c`). Missing segments resolve to `null`.
fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, index) = match segment.find('[') {
            Some(pos) => (&segment[..pos], segment[pos + 1..].trim_end_matches(']').parse::<usize>().ok()),
            None => (segment, None),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
        if let Some(i) = index {
            match current.get(i) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_query() {
        let v = json!({"items": [{"name": "a"}, {"name": "b"}], "n": 1});
        assert_eq!(json_path_query(&v, "items[1].name"), json!("b"));
        assert_eq!(json_path_query(&v, "n"), json!(1));
        assert_eq!(json_path_query(&v, "items[5].name"), json!(null));
        assert_eq!(json_path_query(&v, ""), v);
    }

    #[tokio::test]
    async fn test_tool_accepts_string_or_value() {
        let out = JsonQueryTool
            .execute(json!({"json": "{\"a\": {\"b\": 2}}", "path": "a.b"}))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
        let out = JsonQueryTool
            .execute(json!({"json": {"a": [true]}, "path": "a[0]"}))
            .await
            .unwrap();
        assert_eq!(out, json!(true));
        assert!(JsonQueryTool.execute(json!({"path": "a"})).await.is_err());
    }
}
