use futures::future::BoxFuture;
use serde::Deserialize;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::traits::Function;
use flowline_core::types::Payload;

// ── EchoFunction ────────────────────────────────────────────────

/// Prefixes `text` with `[ECHO] `.
pub struct EchoFunction;

#[derive(Deserialize)]
struct EchoInput {
    text: String,
}

impl Function for EchoFunction {
    fn name(&self) -> &str {
        "echo_function"
    }
    fn description(&self) -> &str {
        "Echo the input text"
    }
    fn call(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let p: EchoInput = serde_json::from_value(serde_json::Value::Object(input)).map_err(|e| {
                FlowlineError::FunctionExecution {
                    function: self.name().to_string(),
                    message: e.to_string(),
                }
            })?;
            let mut out = Payload::new();
            out.insert("text".into(), format!("[ECHO] {}", p.text).into());
            Ok(out)
        })
    }
}

// ── MergeInputsFunction ─────────────────────────────────────────

/// Returns its input unchanged. Used to join branches.
pub struct MergeInputsFunction;

impl Function for MergeInputsFunction {
    fn name(&self) -> &str {
        "merge_inputs"
    }
    fn description(&self) -> &str {
        "Return the merged outputs of all predecessor nodes"
    }
    fn call(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { Ok(input) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        let mut input = Payload::new();
        input.insert("text".into(), json!("hi"));
        let out = EchoFunction.call(input).await.unwrap();
        assert_eq!(out.get("text"), Some(&json!("[ECHO] hi")));
    }

    #[tokio::test]
    async fn test_echo_requires_text() {
        let err = EchoFunction.call(Payload::new()).await.unwrap_err();
        assert!(matches!(err, FlowlineError::FunctionExecution { ref function, .. } if function == "echo_function"));
    }

    #[tokio::test]
    async fn test_merge_passthrough() {
        let mut input = Payload::new();
        input.insert("a".into(), json!(1));
        input.insert("b".into(), json!({"c": 2}));
        let out = MergeInputsFunction.call(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }
}
