use axum::{middleware, routing::get, Router};

use crate::handlers::diagnostics;
use crate::routes::auth_middleware::auth_middleware;
use crate::state::AppState;
use crate::ws::endpoint::ws_handler;

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(protected)
        .with_state(state)
}
