//! Integration tests for the docflow HTTP API.
//!
//! Uses axum-test to drive the router without starting a real server.

// Tests are serialized on a mutex because they touch env vars
#![allow(clippy::unwrap_used, clippy::panic, clippy::await_holding_lock)]

use axum::http::{HeaderValue, StatusCode};
use axum_test::TestServer;
use docflow::api::{
    ActionResponse, AppState, DiagnosticsResponse, HealthResponse, RestoreResponse,
    SnapshotResponse, StateResponse, ValueResponse, create_router,
};
use docflow::config::ServerSettings;
use docflow_core::{
    ActionError, AttributeValue, ComponentKind, ComponentSpec, Document, Resolution, Value,
};
use serde_json::json;
use std::sync::Mutex;

/// Mutex to serialize tests since some of them modify env vars.
static AUTH_TEST_MUTEX: Mutex<()> = Mutex::new(());

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Holds the mutex and clears the API key on drop.
struct TestGuard {
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        // SAFETY: Tests run sequentially under AUTH_TEST_MUTEX, so no concurrent env access.
        unsafe { std::env::remove_var("DOCFLOW_API_KEY") };
    }
}

fn point(name: &str, x: f64, y: f64) -> ComponentSpec {
    ComponentSpec::new(ComponentKind::Point)
        .named(name)
        .attr("coords", AttributeValue::Literal(Value::point(x, y)))
}

/// Two points, the line through them and a fixed third point.
fn line_document() -> Document {
    let spec = ComponentSpec::new(ComponentKind::Document).with_children(vec![
        point("P1", 0.0, 0.0),
        point("P2", 1.0, 1.0),
        ComponentSpec::new(ComponentKind::Line).named("l").attr(
            "through",
            AttributeValue::References(vec!["$P1".into(), "$P2".into()]),
        ),
        point("F", 5.0, 5.0).attr("fixed", AttributeValue::Literal(Value::Bool(true))),
    ]);
    Document::new(&spec).unwrap()
}

fn server_with_key(key: Option<&str>) -> (TestServer, TestGuard) {
    let guard = AUTH_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: Tests run sequentially under AUTH_TEST_MUTEX, so no concurrent env access.
    unsafe {
        match key {
            Some(k) => std::env::set_var("DOCFLOW_API_KEY", k),
            None => std::env::remove_var("DOCFLOW_API_KEY"),
        }
    }
    let router = create_router(AppState::new(line_document()));
    (TestServer::new(router).unwrap(), TestGuard { _guard: guard })
}

fn create_test_server() -> (TestServer, TestGuard) {
    server_with_key(None)
}

fn move_point(target: &str, x: f64, y: f64) -> serde_json::Value {
    json!({
        "kind": "invokeNamedUpdate",
        "target": target,
        "update": "movePoint",
        "args": {"x": {"number": x}, "y": {"number": y}}
    })
}

// =============================================================================
// HEALTH / STATE
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _guard) = create_test_server();

    let response = server.get("/health").await;

    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_state_lists_every_component() {
    let (server, _guard) = create_test_server();

    let response = server.get("/state").await;

    response.assert_status_ok();
    let state: StateResponse = response.json();
    assert_eq!(state.component_count, state.components.len());
    for path in ["/P1", "/P2", "/l", "/F"] {
        assert!(state.components.contains_key(path), "missing {path}");
    }
    assert_eq!(state.components["/l"].kind, ComponentKind::Line);
}

#[tokio::test]
async fn test_diagnostics_start_clean() {
    let (server, _guard) = create_test_server();

    let response = server.get("/diagnostics").await;

    response.assert_status_ok();
    let diagnostics: DiagnosticsResponse = response.json();
    assert!(!diagnostics.has_errors);
}

// =============================================================================
// VALUE ENDPOINT
// =============================================================================

#[tokio::test]
async fn test_value_resolves_derived_variable() {
    let (server, _guard) = create_test_server();

    let response = server.post("/value").json(&json!({"reference": "$l.slope"})).await;

    response.assert_status_ok();
    let value: ValueResponse = response.json();
    assert!(value.success);
    assert_eq!(value.resolution, Some(Resolution::Value(Value::Number(1.0))));
}

#[tokio::test]
async fn test_value_unknown_name_is_not_found() {
    let (server, _guard) = create_test_server();

    let response = server.post("/value").json(&json!({"reference": "$nope"})).await;

    response.assert_status(StatusCode::NOT_FOUND);
    let value: ValueResponse = response.json();
    assert!(!value.success);
    assert!(value.error.is_some());
}

#[tokio::test]
async fn test_value_rejects_empty_reference() {
    let (server, _guard) = create_test_server();

    let response = server.post("/value").json(&json!({"reference": ""})).await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

// =============================================================================
// ACTION ENDPOINT
// =============================================================================

#[tokio::test]
async fn test_action_moves_point_and_line_follows() {
    let (server, _guard) = create_test_server();
    // render once so the line's dependencies are known
    server.get("/state").await.assert_status_ok();

    let response = server.post("/action").json(&move_point("$P1", 0.0, -1.0)).await;

    response.assert_status_ok();
    let action: ActionResponse = response.json();
    assert!(action.success);
    let outcome = action.outcome.unwrap();
    assert_eq!(outcome.changed, vec!["/P1.coords".to_string()]);
    assert!(outcome.affected.contains(&"/l".to_string()));

    let slope: ValueResponse = server
        .post("/value")
        .json(&json!({"reference": "$l.slope"}))
        .await
        .json();
    assert_eq!(slope.resolution, Some(Resolution::Value(Value::Number(2.0))));
}

#[tokio::test]
async fn test_action_on_fixed_point_is_conflict() {
    let (server, _guard) = create_test_server();

    let response = server.post("/action").json(&move_point("$F", 1.0, 1.0)).await;

    response.assert_status(StatusCode::CONFLICT);
    let action: ActionResponse = response.json();
    assert!(!action.success);
    assert!(matches!(action.error, Some(ActionError::NotUpdatable { .. })));
}

#[tokio::test]
async fn test_action_unknown_target_is_not_found() {
    let (server, _guard) = create_test_server();

    let response = server.post("/action").json(&move_point("$Q", 1.0, 1.0)).await;

    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_action_unknown_update_is_bad_request() {
    let (server, _guard) = create_test_server();

    let response = server
        .post("/action")
        .json(&json!({"kind": "invokeNamedUpdate", "target": "$P1", "update": "spin"}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let action: ActionResponse = response.json();
    assert!(matches!(action.error, Some(ActionError::UnknownUpdate { .. })));
}

#[tokio::test]
async fn test_action_malformed_body_is_rejected() {
    let (server, _guard) = create_test_server();

    let response = server.post("/action").json(&json!({"kind": "teleport"})).await;

    assert!(response.status_code().is_client_error());
}

// =============================================================================
// SNAPSHOT ENDPOINTS
// =============================================================================

#[tokio::test]
async fn test_snapshot_round_trip_through_base64() {
    let (server, _guard) = create_test_server();

    server
        .post("/action")
        .json(&move_point("$P2", 3.0, 4.0))
        .await
        .assert_status_ok();
    let snapshot: SnapshotResponse = server.get("/snapshot").await.json();
    assert!(snapshot.success);
    assert!(snapshot.entries > 0);

    server
        .post("/action")
        .json(&move_point("$P2", -7.0, 0.0))
        .await
        .assert_status_ok();

    let response = server
        .post("/snapshot")
        .json(&json!({"data": snapshot.data.unwrap()}))
        .await;
    response.assert_status_ok();
    let restore: RestoreResponse = response.json();
    assert!(restore.success);
    assert!(restore.skipped.is_empty());

    let p2: ValueResponse = server
        .post("/value")
        .json(&json!({"reference": "$P2"}))
        .await
        .json();
    assert_eq!(p2.resolution, Some(Resolution::Value(Value::point(3.0, 4.0))));
}

#[tokio::test]
async fn test_restore_requires_exactly_one_source() {
    let (server, _guard) = create_test_server();

    server
        .post("/snapshot")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/snapshot")
        .json(&json!({"data": "!!not base64!!"}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// =============================================================================
// AUTHENTICATION
// =============================================================================

#[tokio::test]
async fn test_auth_required_when_key_set() {
    let (server, _guard) = server_with_key(Some("test-key"));

    server.get("/state").await.assert_status(StatusCode::UNAUTHORIZED);
    server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_auth_accepts_bearer_token() {
    let (server, _guard) = server_with_key(Some("test-key"));

    let response = server
        .get("/state")
        .add_header(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer test-key"),
        )
        .await;
    response.assert_status_ok();

    let wrong = server
        .get("/state")
        .add_header(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer other-key"),
        )
        .await;
    wrong.assert_status(StatusCode::UNAUTHORIZED);
}

// =============================================================================
// ACTION BUDGET
// =============================================================================

#[tokio::test]
async fn test_action_budget_limits_writes_only() {
    let _guard = server_with_key(None).1;
    let settings = ServerSettings {
        actions_per_second: 1,
        ..ServerSettings::default()
    };
    let server =
        TestServer::new(create_router(AppState::with_settings(line_document(), settings))).unwrap();

    server
        .post("/action")
        .json(&move_point("$P1", 0.0, 2.0))
        .await
        .assert_status_ok();
    server
        .post("/action")
        .json(&move_point("$P1", 0.0, 3.0))
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);

    // reads are never limited
    server.get("/state").await.assert_status_ok();
    server
        .post("/value")
        .json(&json!({"reference": "$P1"}))
        .await
        .assert_status_ok();
}
