use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake!(
    /// A voice/text community; the unit of session exclusivity
    GuildId
);
snowflake!(
    /// A voice channel inside a guild
    ChannelId
);
snowflake!(
    /// A user taking part in a voice channel
    ParticipantId
);

/// Voice connection lifecycle as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl ConnectionState {
    /// States a reusable connection can be in
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Destroyed)
    }

    /// Early states a connection re-enters while reconnecting
    pub fn is_reconnecting(self) -> bool {
        matches!(self, Self::Signalling | Self::Connecting)
    }
}

/// Raw per-participant audio: 16-bit LE PCM, 48 kHz, stereo.
///
/// The stream ends when the sender is dropped; an `Err` item is a stream error.
/// Dropping the receiver destroys the stream.
pub type AudioStream = mpsc::Receiver<std::io::Result<Bytes>>;

/// One live voice connection to a channel
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn guild_id(&self) -> GuildId;

    fn channel_id(&self) -> ChannelId;

    fn state(&self) -> ConnectionState;

    /// Watch the connection state; the current value is observed immediately
    fn state_changes(&self) -> watch::Receiver<ConnectionState>;

    /// Register for "speaking started" signals. Dropping the receiver unregisters.
    fn speaking_events(&self) -> mpsc::UnboundedReceiver<ParticipantId>;

    /// Open the raw audio stream of one participant
    async fn subscribe(&self, participant: ParticipantId) -> Result<AudioStream>;

    /// Leave the channel and release platform resources
    async fn destroy(&self) -> Result<()>;
}

/// Entry point into the platform's voice transport
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Start a connection attempt. The connection is not ready yet.
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>>;
}
