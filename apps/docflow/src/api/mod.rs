//! # docflow HTTP API Module
//!
//! Serves one live document over HTTP using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /state` - Resolved state of every component
//! - `GET /diagnostics` - Diagnostics recorded so far
//! - `POST /value` - Resolve one reference
//! - `POST /action` - Apply an action
//! - `GET /snapshot` - Export essential state
//! - `POST /snapshot` - Restore essential state
//!
//! ## Access
//!
//! Settings come from the `[server]` table of the config file, with
//! environment overrides:
//!
//! - `DOCFLOW_API_KEY`: if set, requires Bearer token authentication
//! - `DOCFLOW_ACTION_RATE`: actions and restores per second (0 disables)
//! - `DOCFLOW_CORS_ORIGINS`: comma-separated origins, or "*" for all
//!   (default: same-origin only)

mod guard;
mod handlers;
mod types;

pub use types::{
    ActionResponse, DiagnosticsResponse, HealthResponse, RestoreResponse, SnapshotResponse,
    StateResponse, ValueResponse,
};

use crate::config::ServerSettings;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use docflow_core::{DocError, Document};
use guard::Guard;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state. Every request, including reads, resolves lazily and
/// so needs exclusive access to the document.
#[derive(Clone)]
pub struct AppState {
    pub document: Arc<Mutex<Document>>,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    /// Serve `document` with default settings plus environment overrides.
    #[must_use]
    pub fn new(document: Document) -> Self {
        Self::with_settings(document, ServerSettings::default().with_env_overrides())
    }

    #[must_use]
    pub fn with_settings(document: Document, settings: ServerSettings) -> Self {
        Self {
            document: Arc::new(Mutex::new(document)),
            settings: Arc::new(settings),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// CORS layer for the configured origins, or `None` for same-origin only.
fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS: allowing every origin");
        return Some(CorsLayer::permissive());
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%origin, error = %e, "CORS: ignoring invalid origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    tracing::info!(origins = allowed.len(), "CORS: allowing configured origins");
    Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    )
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS (if configured), body
/// limit, guard (authentication and the action budget).
pub fn create_router(state: AppState) -> Router {
    let settings = Arc::clone(&state.settings);
    let guard = Arc::new(Guard::new(&settings));
    if guard.requires_key() {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!("API key authentication disabled; set DOCFLOW_API_KEY to enable it");
    }
    if guard.limits_actions() {
        tracing::info!(per_second = settings.actions_per_second, "action rate limit enabled");
    } else {
        tracing::info!("action rate limit disabled");
    }

    let router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/state", get(handlers::state_handler))
        .route("/diagnostics", get(handlers::diagnostics_handler))
        .route("/value", post(handlers::value_handler))
        .route("/action", post(handlers::action_handler))
        .route(
            "/snapshot",
            get(handlers::snapshot_handler).post(handlers::restore_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            guard,
            guard::guard_middleware,
        ))
        .layer(axum::extract::DefaultBodyLimit::max(settings.max_body_bytes));

    let router = match build_cors_layer(&settings.cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve a document until the process is stopped.
pub async fn run_server(
    addr: &str,
    document: Document,
    settings: ServerSettings,
) -> Result<(), DocError> {
    let router = create_router(AppState::with_settings(document, settings));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DocError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("docflow HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| DocError::IoError(format!("Server error: {}", e)))
}
