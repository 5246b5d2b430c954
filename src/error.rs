use thiserror::Error;

use crate::voice::GuildId;

/// Errors surfaced by the voice capture core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice connection for guild {guild} did not become ready within {timeout_secs}s")]
    ConnectionTimeout { guild: GuildId, timeout_secs: u64 },

    #[error("voice connection for guild {0} was lost")]
    ConnectionLost(GuildId),

    #[error("audio subscription failed: {0}")]
    Subscription(String),

    #[error("guild {0} is already recording")]
    AlreadyRecording(GuildId),

    #[error("guild {0} is already broadcasting")]
    AlreadyBroadcasting(GuildId),

    #[error("guild {0} has no active recording")]
    NoActiveRecording(GuildId),

    #[error("guild {0} has no active broadcast")]
    NoActiveBroadcast(GuildId),

    #[error("no audio captured ({bytes} bytes recorded)")]
    NoAudioCaptured { bytes: u64 },

    #[error("transcoding failed: {0}")]
    TranscodeFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
