use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use tracing::warn;

use crate::models::ErrorResponse;
use crate::state::AppState;

/// Guard management routes with a bearer session token.
///
/// The same tokens that authenticate websocket connections also authorize
/// the diagnostics surface. The resolved identity is stored in the request
/// extensions for downstream handlers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    // 1. Get the session token from the Authorization header
    let token = match bearer_token(&req) {
        Some(token) => token,
        None => {
            return Err(unauthorized("Missing Authorization header"));
        }
    };

    // 2. Validate it against the session store
    let user = match state.sessions.validate(&token).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Session validation failed: {}", e);
            return Err(unauthorized("Invalid session"));
        }
    };

    // 3. Expose the identity to downstream handlers
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

fn bearer_token<B>(req: &axum::http::Request<B>) -> Option<String> {
    let auth_header = req.headers().get(header::AUTHORIZATION)?;
    let auth_str = auth_header.to_str().ok()?;
    Some(
        auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string(),
    )
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::unauthorized(message)),
    )
}
