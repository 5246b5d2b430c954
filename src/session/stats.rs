use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::voice::{ChannelId, ConnectionState, GuildId};

/// Where a guild's session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
    Stopping,
    Error,
}

/// Snapshot of a guild's voice session
#[derive(Debug, Clone, Serialize)]
pub struct VoiceSessionInfo {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub connection_state: ConnectionState,
    pub phase: SessionPhase,
    pub recording: bool,
    pub broadcasting: bool,
    pub speakers: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of a finished recording
#[derive(Debug, Clone, Serialize)]
pub struct SavedRecording {
    pub sound_name: String,
    pub path: PathBuf,
}
