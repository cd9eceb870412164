//! Shared-key authentication for the internal surface.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Require the configured internal key as `X-API-Key` or a bearer token.
/// Without a configured key every request passes.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.internal_api_key.as_deref() {
        match presented_key(request.headers()) {
            Some(key) if key == expected => {}
            _ => {
                warn!(path = %request.uri().path(), "Rejected request with missing or wrong API key");
                return Err(ApiError::Unauthorized("unauthorized".to_string()));
            }
        }
    }
    Ok(next.run(request).await)
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
