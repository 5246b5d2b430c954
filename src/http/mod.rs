//! HTTP API server for external control
//!
//! This module provides a REST API for controlling voice sessions:
//! - POST /guilds/:guild_id/recording/start - Start recording a voice channel
//! - POST /guilds/:guild_id/recording/stop - Stop and save the recording
//! - GET /guilds/:guild_id/recording/status - Query recording status
//! - POST /guilds/:guild_id/live/start - Start a live broadcast
//! - GET /guilds/:guild_id/live/stream - Listen to the broadcast (raw PCM)
//! - POST /guilds/:guild_id/live/stop - Stop the live broadcast
//! - GET /guilds/:guild_id/live/status - Query broadcast status
//! - GET /guilds/:guild_id/session - Query the voice session
//! - GET /health - Health check

mod handlers;
mod routes;
mod server;
mod state;

pub use routes::create_router;
pub use server::serve;
pub use state::AppState;
