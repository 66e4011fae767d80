pub mod handlers;
pub mod socket;

use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/ws", get(socket::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::stats_handler))
        .route("/api/config", get(handlers::config_handler))
        .route("/api/rescan", post(handlers::rescan_handler))
        .route("/api/reload-displays", post(handlers::reload_displays_handler))
        .route("/photos/{*path}", get(handlers::serve_rendition))
        .with_state(state)
}
