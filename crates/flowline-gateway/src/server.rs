use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowline_core::config::GatewayConfig;
use flowline_stream::ExecutionService;

use crate::routes;
use crate::state::AppState;

/// HTTP + SSE gateway over an `ExecutionService`.
pub struct GatewayServer {
    config: GatewayConfig,
    service: Arc<ExecutionService>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: Arc<ExecutionService>) -> Self {
        Self { config, service }
    }

    pub fn router(&self) -> Router {
        router(Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        }))
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/executions", post(routes::submit))
        .route("/api/executions/{id}", get(routes::status))
        .route("/api/executions/{id}/stream", get(routes::stream))
        .route("/api/executions/{id}/cancel", post(routes::cancel))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
