//! Shared-secret bearer auth: a single `security.shared_token` comparison
//! gating the replay control routes.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.security.enable_auth {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == state.config.security.shared_token => Ok(next.run(req).await),
        _ => Err(ApiError::Unauthorized),
    }
}
