use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, warn};

use flowline_core::config::ModelConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::traits::ModelClient;
use flowline_core::types::{ModelOutput, ModelRequest};

/// Posts each `ModelRequest` as JSON to a model service and reads back a
/// `ModelOutput`.
pub struct HttpModelClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowlineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ModelClient for HttpModelClient {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelOutput>> {
        Box::pin(async move {
            debug!(
                execution_id = %request.execution_id,
                node = %request.node,
                model = %request.model,
                "Invoking model"
            );

            let mut req = self.http.post(&self.endpoint).json(&request);
            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req.send().await.map_err(|e| {
                let kind = if e.is_timeout() { "timeout" } else { "connection" };
                FlowlineError::ModelInvocation(format!("{} error: {}", kind, e))
            })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(FlowlineError::ModelInvocation(format!("HTTP {}: {}", status, body)));
            }

            let output: ModelOutput = response
                .json()
                .await
                .map_err(|e| FlowlineError::ModelParse(e.to_string()))?;
            Ok(normalize(output))
        })
    }
}

/// Recover a structured payload from text that is itself a JSON object.
pub fn normalize(mut output: ModelOutput) -> ModelOutput {
    if output.structured.is_none() {
        match serde_json::from_str::<serde_json::Value>(output.text.trim()) {
            Ok(serde_json::Value::Object(map)) => output.structured = Some(map),
            Ok(_) => {}
            Err(_) if output.text.trim_start().starts_with('{') => {
                warn!("Model text looks like JSON but does not parse");
            }
            Err(_) => {}
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_recovers_json_text() {
        let out = normalize(ModelOutput::text(r#" {"next_node": "B"} "#));
        assert_eq!(
            out.structured.map(serde_json::Value::Object),
            Some(json!({"next_node": "B"}))
        );
    }

    #[test]
    fn test_normalize_leaves_plain_text() {
        assert!(normalize(ModelOutput::text("just words")).structured.is_none());
        assert!(normalize(ModelOutput::text("[1, 2]")).structured.is_none());
        assert!(normalize(ModelOutput::text("{broken")).structured.is_none());
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        let config = ModelConfig {
            endpoint: "http://127.0.0.1:9/invoke".into(),
            api_key: Some(String::new()),
            timeout_secs: 5,
            max_retries: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        };
        let client = HttpModelClient::new(&config).unwrap();
        assert!(client.api_key.is_none());
        assert_eq!(client.endpoint(), "http://127.0.0.1:9/invoke");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let config = ModelConfig {
            endpoint: "http://127.0.0.1:9/invoke".into(),
            api_key: None,
            timeout_secs: 2,
            max_retries: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        };
        let client = HttpModelClient::new(&config).unwrap();
        let request = ModelRequest {
            execution_id: flowline_core::types::ExecutionId::new(),
            node: "A".into(),
            model: "m".into(),
            instruction: "i".into(),
            messages: vec![],
            tools: vec![],
            output_schema: None,
        };
        match client.invoke(request).await {
            Err(FlowlineError::ModelInvocation(msg)) => assert!(msg.contains("error")),
            other => panic!("unexpected result: {:?}", other.map(|o| o.text)),
        }
    }
}
