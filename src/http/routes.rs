use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Recording control
        .route(
            "/guilds/:guild_id/recording/start",
            post(handlers::start_recording),
        )
        .route(
            "/guilds/:guild_id/recording/stop",
            post(handlers::stop_recording),
        )
        .route(
            "/guilds/:guild_id/recording/status",
            get(handlers::recording_status),
        )
        // Live broadcast
        .route("/guilds/:guild_id/live/start", post(handlers::start_live))
        .route("/guilds/:guild_id/live/stream", get(handlers::live_stream))
        .route("/guilds/:guild_id/live/stop", post(handlers::stop_live))
        .route("/guilds/:guild_id/live/status", get(handlers::live_status))
        // Session queries
        .route("/guilds/:guild_id/session", get(handlers::get_session))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
