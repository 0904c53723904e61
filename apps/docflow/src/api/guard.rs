//! # Request Guard
//!
//! One middleware in front of every docflow route:
//!
//! - `DOCFLOW_API_KEY`: when set, every route except `/health` needs
//!   `Authorization: Bearer <key>` (or the raw key)
//! - mutating routes (`POST /action`, `POST /snapshot`) share one
//!   actions-per-second budget. Reads are not limited.

use crate::config::ServerSettings;
use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type ActionLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Access policy of one server, fixed when the router is built.
pub struct Guard {
    api_key: Option<String>,
    limiter: Option<ActionLimiter>,
}

impl Guard {
    /// Build from settings plus `DOCFLOW_API_KEY`.
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            api_key: api_key_from_env(),
            limiter: NonZeroU32::new(settings.actions_per_second)
                .map(|rate| RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    pub fn requires_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn limits_actions(&self) -> bool {
        self.limiter.is_some()
    }

    fn authorized(&self, request: &Request<Body>) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
            .is_some_and(|provided| keys_match(provided, expected))
    }

    fn admit_action(&self) -> bool {
        self.limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }
}

/// `DOCFLOW_API_KEY`, or `None` when unset or empty.
fn api_key_from_env() -> Option<String> {
    std::env::var("DOCFLOW_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

/// Whether a request changes the document.
fn is_mutation(method: &Method, path: &str) -> bool {
    method == Method::POST && matches!(path, "/action" | "/snapshot")
}

/// Compare two keys in constant time over the longer length.
fn keys_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    let len = provided.len().max(expected.len());
    let mut a = vec![0u8; len];
    let mut b = vec![0u8; len];
    a[..provided.len()].copy_from_slice(provided);
    b[..expected.len()].copy_from_slice(expected);
    bool::from(a.ct_eq(&b)) && provided.len() == expected.len()
}

/// Reject unauthenticated requests with 401 and over-budget mutations
/// with 429.
pub async fn guard_middleware(
    State(guard): State<Arc<Guard>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let path = request.uri().path();
    if path != "/health" && !guard.authorized(&request) {
        tracing::warn!(event = "auth_failure", %path, "rejected request without a valid API key");
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    if is_mutation(request.method(), path) && !guard.admit_action() {
        tracing::warn!(%path, "action rate limit exceeded");
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"));
    }
    Ok(next.run(request).await)
}
