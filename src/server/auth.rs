//! Bearer-token authentication middleware.
//!
//! Every action endpoint requires `Authorization: Bearer <key>` against the
//! configured key list; `/service.health` and `/service.capabilities` are
//! exempt. Key comparison is constant-time per key to avoid timing leaks.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use super::envelope::ResponseEnvelope;

/// Paths reachable without authentication.
const EXEMPT_PATHS: &[&str] = &["/service.health", "/service.capabilities"];

/// Accepted bearer keys. An empty list disables auth entirely.
#[derive(Debug, Clone)]
pub struct BearerKeys {
    keys: Vec<Vec<u8>>,
}

impl BearerKeys {
    pub fn new(keys: &[String]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Check the provided token against every configured key.
    fn verify(&self, provided: &[u8]) -> bool {
        self.keys.iter().any(|key| constant_time_eq(key, provided))
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (a, b) in expected.iter().zip(provided.iter()) {
        acc |= a ^ b;
    }
    acc == 0
}

/// Extract the bearer token from the Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Axum middleware enforcing the bearer gate.
pub async fn bearer_auth(keys: BearerKeys, request: Request<Body>, next: Next) -> Response {
    if !keys.is_enabled() || EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    match extract_bearer_token(request.headers()) {
        Some(token) if keys.verify(token.as_bytes()) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "invalid API key");
            unauthorized("invalid API key")
        }
        None => {
            warn!(path = %request.uri().path(), "missing Authorization header");
            unauthorized("missing or malformed Authorization header, expected: Bearer <key>")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ResponseEnvelope::error("", "", "UNAUTHORIZED", message, 0)),
    )
        .into_response()
}
