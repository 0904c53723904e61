//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use docflow_core::{
    ActionError, ActionOutcome, Diagnostic, EssentialSnapshot, RenderedComponent, Resolution,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATE RESPONSE
// =============================================================================

/// Resolved state of every component, keyed by name path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub component_count: usize,
    pub components: BTreeMap<String, RenderedComponent>,
}

/// Diagnostics recorded so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResponse {
    pub count: usize,
    pub has_errors: bool,
    pub diagnostics: Vec<Diagnostic>,
}

// =============================================================================
// ACTION RESPONSE
// =============================================================================

/// Result of one action. The request body is a `docflow_core::Action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub outcome: Option<ActionOutcome>,
    pub error: Option<ActionError>,
}

impl ActionResponse {
    #[must_use]
    pub fn success(outcome: ActionOutcome) -> Self {
        Self {
            success: true,
            outcome: Some(outcome),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: ActionError) -> Self {
        Self {
            success: false,
            outcome: None,
            error: Some(error),
        }
    }
}

// =============================================================================
// VALUE REQUEST/RESPONSE
// =============================================================================

/// Resolve one reference (`$P.x`, `$m[2]/Q`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRequest {
    pub reference: String,
}

/// Resolution of one reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueResponse {
    pub success: bool,
    pub reference: String,
    pub resolution: Option<Resolution>,
    pub error: Option<String>,
}

impl ValueResponse {
    #[must_use]
    pub fn resolved(reference: String, resolution: Resolution) -> Self {
        Self {
            success: true,
            reference,
            resolution: Some(resolution),
            error: None,
        }
    }

    #[must_use]
    pub fn error(reference: String, message: impl Into<String>) -> Self {
        Self {
            success: false,
            reference,
            resolution: None,
            error: Some(message.into()),
        }
    }
}

// =============================================================================
// SNAPSHOT REQUEST/RESPONSE
// =============================================================================

/// Exported essential state.
///
/// `data` is the binary snapshot, base64-encoded; `snapshot` carries the
/// same entries as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub success: bool,
    pub format: String,
    pub entries: usize,
    pub data: Option<String>,
    pub snapshot: Option<EssentialSnapshot>,
    pub error: Option<String>,
}

impl SnapshotResponse {
    #[must_use]
    pub fn success(data: String, snapshot: EssentialSnapshot) -> Self {
        Self {
            success: true,
            format: "docflow_snapshot_v1".to_string(),
            entries: snapshot.len(),
            data: Some(data),
            snapshot: Some(snapshot),
            error: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            format: String::new(),
            entries: 0,
            data: None,
            snapshot: None,
            error: Some(message.into()),
        }
    }
}

/// Restore essential state, either from base64 `data` or a JSON `snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub snapshot: Option<EssentialSnapshot>,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub success: bool,
    pub applied: usize,
    pub skipped: Vec<String>,
    pub error: Option<String>,
}

impl RestoreResponse {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            applied: 0,
            skipped: Vec::new(),
            error: Some(message.into()),
        }
    }
}
