//! Voice connections
//!
//! The platform's voice transport sits behind [`VoiceGateway`] and
//! [`VoiceConnection`]; [`VoiceConnectionRegistry`] keeps at most one
//! connection per guild and turns unrecoverable disconnects into
//! [`SessionEvent::ConnectionLost`](crate::session::SessionEvent).

mod connection;
mod loopback;
mod registry;

pub use connection::{
    AudioStream, ChannelId, ConnectionState, GuildId, ParticipantId, VoiceConnection, VoiceGateway,
};
pub use loopback::{LoopbackConnection, LoopbackGateway};
pub use registry::{ConnectionId, VoiceConnectionRegistry};
pub(crate) use registry::same_connection;
