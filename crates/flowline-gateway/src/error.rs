use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use flowline_core::error::FlowlineError;

/// Maps core errors onto HTTP responses.
pub struct ApiError(pub FlowlineError);

impl From<FlowlineError> for ApiError {
    fn from(e: FlowlineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            FlowlineError::Validation(report) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({
                    "error": "validation_failed",
                    "issues": report.issues,
                    "warnings": report.warnings,
                }),
            ),
            FlowlineError::ExecutionNotFound(_) | FlowlineError::SpecNotFound(_) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": self.0.to_string() }),
            ),
            FlowlineError::SpecParse(_) | FlowlineError::Config(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": self.0.to_string() }),
            ),
            other => {
                error!(error = %other, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": other.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
