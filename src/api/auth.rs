//! API token authentication
//!
//! Protects the management API with the static bearer token from
//! configuration. The webhook endpoint is excluded; it authenticates
//! payloads with an HMAC signature instead (see [`crate::push`]).

use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
}

/// Middleware to require the configured API token
///
/// Rejects the request with 403 when the Authorization header is missing
/// or carries a different token.
///
/// # Usage
/// ```ignore
/// let protected_routes = Router::new()
///     .route("/api/v1/...", ...)
///     .route_layer(middleware::from_fn_with_state(state, require_api_token));
/// ```
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token_from_headers(request.headers()).ok_or(AppError::Unauthorized)?;

    if token != state.config.server.api_token {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
