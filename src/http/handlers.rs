use super::state::AppState;
use crate::capture::{PCM_CHANNELS, PCM_SAMPLE_RATE};
use crate::error::VoiceError;
use crate::voice::{ChannelId, GuildId};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRecordingRequest {
    /// Voice channel to record
    pub channel_id: ChannelId,

    /// Optional name for the saved sound (sanitized; timestamp if absent)
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartRecordingResponse {
    pub guild_id: GuildId,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StopRecordingResponse {
    pub guild_id: GuildId,
    pub sound_name: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct StartLiveRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub guild_id: GuildId,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: VoiceError) -> Response {
    let status = match &e {
        VoiceError::ConnectionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        VoiceError::AlreadyRecording(_) | VoiceError::AlreadyBroadcasting(_) => {
            StatusCode::CONFLICT
        }
        VoiceError::NoActiveRecording(_) | VoiceError::NoActiveBroadcast(_) => {
            StatusCode::NOT_FOUND
        }
        VoiceError::NoAudioCaptured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", e);
    }

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Recording
// ============================================================================

/// POST /guilds/:guild_id/recording/start
/// Join the channel (or reuse the session) and start recording it
pub async fn start_recording(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
    Json(req): Json<StartRecordingRequest>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);
    info!(
        "Guild {}: recording requested for channel {}",
        guild, req.channel_id
    );

    match state
        .orchestrator
        .start_recording(guild, req.channel_id, req.name.as_deref())
        .await
    {
        Ok(job) => (
            StatusCode::OK,
            Json(StartRecordingResponse {
                guild_id: guild,
                status: "recording".to_string(),
                message: format!("Recording started as {}", job.sound_name()),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /guilds/:guild_id/recording/stop
/// Stop recording and transcode the capture into the sounds directory
pub async fn stop_recording(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);

    match state.orchestrator.stop_recording(guild).await {
        Ok(saved) => {
            info!("Guild {}: recording saved as {}", guild, saved.sound_name);
            (
                StatusCode::OK,
                Json(StopRecordingResponse {
                    guild_id: guild,
                    sound_name: saved.sound_name,
                    path: saved.path.display().to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /guilds/:guild_id/recording/status
pub async fn recording_status(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let status = state
        .orchestrator
        .recording_status(GuildId::from(guild_id))
        .await;
    (StatusCode::OK, Json(status))
}

// ============================================================================
// Live broadcast
// ============================================================================

/// POST /guilds/:guild_id/live/start
pub async fn start_live(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
    Json(req): Json<StartLiveRequest>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);

    match state.orchestrator.start_broadcast(guild, req.channel_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse {
                guild_id: guild,
                status: "streaming".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /guilds/:guild_id/live/stream
/// Open-ended raw PCM body; ends when the broadcast stops
pub async fn live_stream(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);

    let listener = match state.orchestrator.open_listener(guild).await {
        Ok(listener) => listener,
        Err(e) => return error_response(e),
    };
    info!("Guild {}: listener {} connected", guild, listener.id());

    let content_type = format!(
        "audio/L16;rate={};channels={}",
        PCM_SAMPLE_RATE, PCM_CHANNELS
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
        ],
        Body::from_stream(listener.map(Ok::<_, Infallible>)),
    )
        .into_response()
}

/// POST /guilds/:guild_id/live/stop
pub async fn stop_live(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);

    match state.orchestrator.stop_broadcast(guild).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse {
                guild_id: guild,
                status: "stopped".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /guilds/:guild_id/live/status
pub async fn live_status(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let status = state.orchestrator.live_status(GuildId::from(guild_id));
    (StatusCode::OK, Json(status))
}

// ============================================================================
// Session
// ============================================================================

/// GET /guilds/:guild_id/session
pub async fn get_session(
    State(state): State<AppState>,
    Path(guild_id): Path<u64>,
) -> impl IntoResponse {
    let guild = GuildId::from(guild_id);

    match state.orchestrator.session(guild).await {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Guild {} has no voice session", guild),
            }),
        )
            .into_response(),
    }
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
