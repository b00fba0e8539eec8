//! Control API: start/stop a replay, inspect its status, and the ambient
//! health/metrics surface.

mod auth;
mod handlers;

pub use auth::bearer_auth_middleware;

use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let replay_routes = Router::new()
        .route("/replay/start", post(handlers::start_replay))
        .route("/replay/stop", post(handlers::stop_replay))
        .route("/replay/status", get(handlers::replay_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .merge(replay_routes)
        .layer(cors)
        .with_state(state)
}
