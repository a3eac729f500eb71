pub mod http;
pub mod retry;

use std::sync::Arc;

use flowline_core::config::ModelConfig;
use flowline_core::error::Result;
use flowline_core::traits::ModelClient;

pub use http::HttpModelClient;
pub use retry::{RetryPolicy, RetryingClient};

/// Build the model client for `config`: HTTP, wrapped in retries when enabled.
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    let http: Arc<dyn ModelClient> = Arc::new(HttpModelClient::new(config)?);
    if config.max_retries == 0 {
        return Ok(http);
    }
    Ok(Arc::new(RetryingClient::new(http, RetryPolicy::from(config))))
}
