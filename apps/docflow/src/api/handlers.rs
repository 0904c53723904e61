//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.

use super::{
    AppState,
    types::{
        ActionResponse, DiagnosticsResponse, HealthResponse, RestoreRequest, RestoreResponse,
        SnapshotResponse, StateResponse, ValueRequest, ValueResponse,
    },
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::{Engine, engine::general_purpose::STANDARD};
use docflow_core::{
    Action, ActionError, DocError, EssentialSnapshot, Severity, snapshot_from_bytes,
    snapshot_to_bytes,
};

/// Largest reference text accepted by `/value`.
const MAX_REFERENCE_LENGTH: usize = 1024;

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STATE HANDLERS
// =============================================================================

/// Resolved state of every component.
pub async fn state_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut document = state.document.lock().await;
    let components = document.state_values();
    let response = StateResponse {
        component_count: components.len(),
        components,
    };
    (StatusCode::OK, Json(response))
}

/// Diagnostics recorded so far.
pub async fn diagnostics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let document = state.document.lock().await;
    let diagnostics = document.diagnostics().to_vec();
    let response = DiagnosticsResponse {
        count: diagnostics.len(),
        has_errors: diagnostics.iter().any(|d| d.severity == Severity::Error),
        diagnostics,
    };
    (StatusCode::OK, Json(response))
}

/// Resolve one reference.
pub async fn value_handler(
    State(state): State<AppState>,
    Json(request): Json<ValueRequest>,
) -> impl IntoResponse {
    if request.reference.is_empty() || request.reference.len() > MAX_REFERENCE_LENGTH {
        let response = ValueResponse::error(request.reference, "invalid reference length");
        return (StatusCode::BAD_REQUEST, Json(response));
    }

    let mut document = state.document.lock().await;
    match document.resolution(&request.reference) {
        Ok(resolution) => (
            StatusCode::OK,
            Json(ValueResponse::resolved(request.reference, resolution)),
        ),
        Err(e) => {
            let status = doc_error_status(&e);
            (status, Json(ValueResponse::error(request.reference, e.to_string())))
        }
    }
}

// =============================================================================
// ACTION HANDLER
// =============================================================================

/// Apply one action.
pub async fn action_handler(
    State(state): State<AppState>,
    Json(action): Json<Action>,
) -> impl IntoResponse {
    let mut document = state.document.lock().await;
    match document.apply_action(&action) {
        Ok(outcome) => (StatusCode::OK, Json(ActionResponse::success(outcome))),
        Err(e) => (action_error_status(&e), Json(ActionResponse::failure(e))),
    }
}

/// HTTP status for a rejected action.
fn action_error_status(error: &ActionError) -> StatusCode {
    match error {
        ActionError::TargetNotFound { .. } => StatusCode::NOT_FOUND,
        ActionError::UnknownUpdate { .. } | ActionError::InvalidPayload { .. } => {
            StatusCode::BAD_REQUEST
        }
        ActionError::NotUpdatable { .. } | ActionError::Reverted { .. } => StatusCode::CONFLICT,
        ActionError::Disposed => StatusCode::GONE,
    }
}

/// HTTP status for a failed query.
fn doc_error_status(error: &DocError) -> StatusCode {
    match error {
        DocError::NotFound(_) => StatusCode::NOT_FOUND,
        DocError::Disposed => StatusCode::GONE,
        DocError::Ambiguous(_) | DocError::InvalidReference { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// SNAPSHOT HANDLERS
// =============================================================================

/// Export essential state.
pub async fn snapshot_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut document = state.document.lock().await;
    let snapshot = match document.export_essential_state() {
        Ok(s) => s,
        Err(e) => {
            return (
                doc_error_status(&e),
                Json(SnapshotResponse::error(format!("Export failed: {}", e))),
            );
        }
    };

    match snapshot_to_bytes(&snapshot) {
        Ok(bytes) => (
            StatusCode::OK,
            Json(SnapshotResponse::success(STANDARD.encode(bytes), snapshot)),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SnapshotResponse::error(format!("Export failed: {}", e))),
        ),
    }
}

/// Decode a restore request into a snapshot.
fn decode_restore(request: RestoreRequest) -> Result<EssentialSnapshot, String> {
    match (request.data, request.snapshot) {
        (Some(data), None) => {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| format!("Invalid base64: {}", e))?;
            snapshot_from_bytes(&bytes).map_err(|e| format!("Invalid snapshot: {}", e))
        }
        (None, Some(snapshot)) => Ok(snapshot),
        (Some(_), Some(_)) => Err("Provide either data or snapshot, not both".to_string()),
        (None, None) => Err("Missing data or snapshot".to_string()),
    }
}

/// Restore essential state.
pub async fn restore_handler(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> impl IntoResponse {
    let snapshot = match decode_restore(request) {
        Ok(s) => s,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(RestoreResponse::error(message)));
        }
    };

    let mut document = state.document.lock().await;
    match document.restore_essential_state(&snapshot) {
        Ok(report) => (
            StatusCode::OK,
            Json(RestoreResponse {
                success: true,
                applied: report.applied,
                skipped: report.skipped,
                error: None,
            }),
        ),
        Err(e) => (
            doc_error_status(&e),
            Json(RestoreResponse::error(format!("Restore failed: {}", e))),
        ),
    }
}
