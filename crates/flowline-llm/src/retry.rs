use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use flowline_core::config::ModelConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::traits::ModelClient;
use flowline_core::types::{ModelOutput, ModelRequest};

/// Backoff settings for `RetryingClient`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl From<&ModelConfig> for RetryPolicy {
    fn from(config: &ModelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// A model client that retries transient failures with jittered backoff.
pub struct RetryingClient {
    inner: Arc<dyn ModelClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

fn is_retryable(e: &FlowlineError) -> bool {
    match e {
        FlowlineError::ModelInvocation(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.max_backoff_ms);
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ModelClient for RetryingClient {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelOutput>> {
        Box::pin(async move {
            let max_retries = self.policy.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.invoke(request.clone()).await {
                    Ok(output) => return Ok(output),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let delay = backoff(attempt, &self.policy);
                        warn!(
                            node = %request.node,
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying model request"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
