pub mod broadcast;
pub mod capture;
pub mod config;
pub mod error;
pub mod http;
pub mod recording;
pub mod session;
mod sync;
pub mod voice;

pub use broadcast::{BroadcastSession, ListenerSink, ListenerStream, LiveBroadcaster, LiveStatus};
pub use capture::{Sink, SinkKind, SpeakerMultiplexer};
pub use config::Config;
pub use error::{Result, VoiceError};
pub use http::{create_router, serve, AppState};
pub use recording::{FfmpegTranscoder, Recorder, RecordingJob, RecordingStatus, Transcoder};
pub use session::{SavedRecording, SessionEvent, SessionOrchestrator, SessionPhase, VoiceSessionInfo};
pub use voice::{
    ChannelId, ConnectionId, ConnectionState, GuildId, LoopbackGateway, ParticipantId,
    VoiceConnection, VoiceConnectionRegistry, VoiceGateway,
};
