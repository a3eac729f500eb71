use std::sync::Arc;

use flowline_core::config::GatewayConfig;
use flowline_stream::ExecutionService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub service: Arc<ExecutionService>,
}

impl AppState {
    /// Absolute URL of an execution's event stream.
    pub fn stream_url(&self, execution_id: &str) -> String {
        format!(
            "{}/api/executions/{}/stream",
            self.config.public_url(),
            execution_id
        )
    }
}
