//! Router assembly.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use super::state::AppState;

/// Maximum request body size (1 MiB; prompts, not uploads).
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/interactive/start", post(handlers::start_session))
        .route("/interactive/status", get(handlers::get_status))
        .route("/interactive/{session_id}", delete(handlers::end_session))
        .route("/message", post(handlers::send_message))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
