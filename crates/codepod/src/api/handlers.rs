//! Request handlers for the session API.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::session::{CreateSessionRequest, SessionSummary};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List all sessions.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionSummary>>> {
    let sessions = state.sessions.list_sessions();
    info!(count = sessions.len(), "Listed sessions");
    Ok(Json(sessions))
}

/// Get a specific session by ID.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    Ok(Json(state.sessions.get_session(&session_id)?))
}

/// Create a new session.
///
/// Responds once the editor container has started; readiness is checked in
/// the background.
#[instrument(skip(state, payload))]
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SessionSummary>)> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let session = state.sessions.create_session(request).await?;
    info!(session_id = %session.id, port = session.port, "Created new session");
    Ok((StatusCode::CREATED, Json(session)))
}

/// Delete a session and release everything it holds.
#[instrument(skip(state))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let report = state.sessions.delete_session(&session_id).await?;
    info!(
        session_id = %session_id,
        cleanup_failures = report.failures.len(),
        "Deleted session"
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Number of trailing lines to return.
    pub tail: Option<u32>,
}

/// Fetch the tail of a session's container output as plain text.
#[instrument(skip(state))]
pub async fn session_logs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    Ok(state.sessions.session_logs(&session_id, query.tail).await?)
}
