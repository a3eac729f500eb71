use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use flowline_core::error::FlowlineError;
use flowline_core::spec::GraphSpec;
use flowline_core::sse;
use flowline_core::types::{EventId, ExecutionId, Payload};

use crate::error::ApiError;
use crate::state::AppState;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Either an inline spec or the id of a stored one.
#[derive(Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub spec: Option<GraphSpec>,
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub input: Payload,
}

// POST /api/executions
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = match (body.spec, body.graph_id) {
        (Some(spec), _) => state.service.submit(&spec, body.input).await?,
        (None, Some(graph_id)) => state.service.submit_from_source(&graph_id, body.input).await?,
        (None, None) => {
            return Err(FlowlineError::SpecParse("either 'spec' or 'graph_id' is required".into()).into())
        }
    };
    info!(execution_id = %id, "Execution accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "execution_id": id.to_string(),
            "stream_url": state.stream_url(id.as_str()),
        })),
    ))
}

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub last_event_id: Option<String>,
}

/// Resume point: the query parameter wins over the `Last-Event-ID` header.
fn last_event_id(query: &StreamQuery, headers: &HeaderMap) -> Option<EventId> {
    let raw = query.last_event_id.clone().or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })?;
    EventId::parse(&raw)
}

// GET /api/executions/{id}/stream
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let execution_id = ExecutionId::from_string(&id);
    let last_seen = last_event_id(&query, &headers);
    debug!(execution_id = %execution_id, last_seen = ?last_seen, "Stream requested");

    let events = state.service.subscribe(&execution_id, last_seen).await?;
    let body = Body::from_stream(events.map(|event| Ok::<_, Infallible>(sse::encode(&event))));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response())
}

// POST /api/executions/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution_id = ExecutionId::from_string(&id);
    state.service.cancel(&execution_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "execution_id": id, "cancel_requested": true })),
    ))
}

// GET /api/executions/{id}
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.service.status(&ExecutionId::from_string(&id)).await?;
    Ok(Json(summary))
}
