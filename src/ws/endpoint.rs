use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::services::session_service::SessionError;
use crate::state::AppState;
use crate::ws::client::run_connection;
use crate::ws::DEFAULT_COLOR;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
    pub color: Option<String>,
}

/// Upgrade endpoint for the realtime grid.
///
/// The session token travels as a query parameter because browsers cannot
/// set headers on a websocket handshake. Authentication happens before the
/// upgrade so a bad token costs a plain 401, not a torn-down socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = params.session_id.filter(|t| !t.is_empty()) else {
        warn!("Websocket connection rejected: missing session_id");
        return (StatusCode::UNAUTHORIZED, "Missing session_id").into_response();
    };

    let mut user = match state.sessions.validate(&session_id).await {
        Ok(user) => user,
        Err(SessionError::InvalidSession) => {
            warn!("Websocket connection rejected: invalid or expired session");
            return (StatusCode::UNAUTHORIZED, "Invalid session").into_response();
        }
        Err(e) => {
            error!("Websocket connection rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, "Invalid session").into_response();
        }
    };

    if !origin_allowed(&headers, &state.allowed_origins) {
        warn!(
            "Websocket origin rejected: {:?} (allowed: {:?})",
            headers.get(header::ORIGIN),
            state.allowed_origins
        );
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    user.color = params
        .color
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_COLOR.to_string());

    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| run_connection(socket, hub, user))
}

/// An empty allow-list permits everything. Requests without an Origin header
/// come from non-browser clients and pass, the session token is what gates
/// them.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed.iter().any(|a| a == origin),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        let headers = headers_with_origin("https://evil.example.com");
        assert!(origin_allowed(&headers, &[]));
    }

    #[test]
    fn listed_origin_passes_others_fail() {
        let allowed = vec!["https://grid.example.com".to_string()];
        assert!(origin_allowed(
            &headers_with_origin("https://grid.example.com"),
            &allowed
        ));
        assert!(!origin_allowed(
            &headers_with_origin("https://evil.example.com"),
            &allowed
        ));
    }

    #[test]
    fn missing_origin_header_passes() {
        let allowed = vec!["https://grid.example.com".to_string()];
        assert!(origin_allowed(&HeaderMap::new(), &allowed));
    }
}
