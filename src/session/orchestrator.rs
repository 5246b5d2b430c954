use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use super::event::SessionEvent;
use super::stats::{SavedRecording, SessionPhase, VoiceSessionInfo};
use crate::broadcast::{ListenerStream, LiveBroadcaster, LiveStatus};
use crate::capture::{Sink, SinkKind, SpeakerMultiplexer};
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::recording::{Recorder, RecordingJob, RecordingStatus, Transcoder};
use crate::sync::lock;
use crate::voice::{
    ChannelId, ConnectionId, GuildId, VoiceConnection, VoiceConnectionRegistry, VoiceGateway,
};

/// Per-guild state, only touched while holding the guild's lock
struct GuildState {
    phase: SessionPhase,
    multiplexer: Option<SpeakerMultiplexer>,
    /// The registry connection the current capture runs on
    connection: Option<ConnectionId>,
    created_at: Option<DateTime<Utc>>,
}

impl GuildState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            multiplexer: None,
            connection: None,
            created_at: None,
        }
    }
}

/// Ties connections, capture and both sinks together per guild.
///
/// Recording and broadcasting are independent on a shared connection; the
/// connection is released once neither is active. Every entry point and
/// every asynchronous event for a guild runs under that guild's lock.
pub struct SessionOrchestrator {
    registry: VoiceConnectionRegistry,
    recorder: Recorder,
    broadcaster: LiveBroadcaster,
    guilds: Mutex<HashMap<GuildId, Arc<AsyncMutex<GuildState>>>>,
}

impl SessionOrchestrator {
    /// Build the orchestrator and start its event loop. Requires a Tokio runtime.
    pub fn new(
        config: &Config,
        gateway: Arc<dyn VoiceGateway>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            registry: VoiceConnectionRegistry::new(gateway, config.voice.clone(), events_tx.clone()),
            recorder: Recorder::new(config.recording.clone(), transcoder),
            broadcaster: LiveBroadcaster::new(config.broadcast.clone(), events_tx),
            guilds: Mutex::new(HashMap::new()),
        });

        tokio::spawn(run_events(Arc::downgrade(&orchestrator), events_rx));
        orchestrator
    }

    fn guild(&self, guild: GuildId) -> Arc<AsyncMutex<GuildState>> {
        Arc::clone(
            lock(&self.guilds)
                .entry(guild)
                .or_insert_with(|| Arc::new(AsyncMutex::new(GuildState::new()))),
        )
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub async fn start_recording(
        &self,
        guild: GuildId,
        channel: ChannelId,
        name_hint: Option<&str>,
    ) -> Result<RecordingJob> {
        let slot = self.guild(guild);
        let mut state = slot.lock().await;

        if self.recorder.is_recording(guild).await {
            return Err(VoiceError::AlreadyRecording(guild));
        }

        let conn = self.connect(guild, channel, &mut state).await?;

        match self.recorder.start(guild, name_hint).await {
            Ok((job, sink)) => {
                let sink: Arc<dyn Sink> = sink;
                attach(&mut state, guild, conn, sink);
                state.phase = SessionPhase::Active;
                Ok(job)
            }
            Err(e) => {
                error!("Guild {}: failed to start recording: {}", guild, e);
                state.phase = SessionPhase::Error;
                self.settle(guild, &mut state).await;
                Err(e)
            }
        }
    }

    /// Stop capturing and produce the final file.
    ///
    /// Transcoding runs after the guild lock is released, so the guild can
    /// start a new recording meanwhile.
    pub async fn stop_recording(&self, guild: GuildId) -> Result<SavedRecording> {
        let job = {
            let slot = self.guild(guild);
            let mut state = slot.lock().await;

            if !self.recorder.is_recording(guild).await {
                return Err(VoiceError::NoActiveRecording(guild));
            }

            state.phase = SessionPhase::Stopping;
            if let Some(mux) = &state.multiplexer {
                mux.remove_sink(SinkKind::Recording);
            }
            let job = self.recorder.stop(guild, false).await;
            self.settle(guild, &mut state).await;
            job.ok_or(VoiceError::NoActiveRecording(guild))?
        };

        let path = self.recorder.transcode(&job).await?;
        Ok(SavedRecording {
            sound_name: job.sound_name(),
            path,
        })
    }

    pub async fn recording_status(&self, guild: GuildId) -> RecordingStatus {
        self.recorder.status(guild).await
    }

    // ------------------------------------------------------------------
    // Live broadcast
    // ------------------------------------------------------------------

    pub async fn start_broadcast(&self, guild: GuildId, channel: ChannelId) -> Result<()> {
        let slot = self.guild(guild);
        let mut state = slot.lock().await;

        if self.broadcaster.is_broadcasting(guild) {
            return Err(VoiceError::AlreadyBroadcasting(guild));
        }

        let conn = self.connect(guild, channel, &mut state).await?;

        match self.broadcaster.start(guild) {
            Ok(session) => {
                let sink: Arc<dyn Sink> = session;
                attach(&mut state, guild, conn, sink);
                state.phase = SessionPhase::Active;
                Ok(())
            }
            Err(e) => {
                state.phase = SessionPhase::Error;
                self.settle(guild, &mut state).await;
                Err(e)
            }
        }
    }

    /// Connect a remote listener to the guild's broadcast
    pub async fn open_listener(&self, guild: GuildId) -> Result<ListenerStream> {
        let slot = self.guild(guild);
        let _state = slot.lock().await;
        self.broadcaster.open_listener(guild)
    }

    pub async fn stop_broadcast(&self, guild: GuildId) -> Result<()> {
        let slot = self.guild(guild);
        let mut state = slot.lock().await;

        if !self.broadcaster.is_broadcasting(guild) {
            return Err(VoiceError::NoActiveBroadcast(guild));
        }

        state.phase = SessionPhase::Stopping;
        if let Some(mux) = &state.multiplexer {
            mux.remove_sink(SinkKind::Broadcast);
        }
        self.broadcaster.stop(guild).await;
        self.settle(guild, &mut state).await;
        Ok(())
    }

    pub fn live_status(&self, guild: GuildId) -> LiveStatus {
        self.broadcaster.status(guild)
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub async fn session(&self, guild: GuildId) -> Option<VoiceSessionInfo> {
        let slot = self.guild(guild);
        let state = slot.lock().await;
        let conn = self.registry.get(guild).await?;

        Some(VoiceSessionInfo {
            guild_id: guild,
            channel_id: conn.channel_id(),
            connection_state: conn.state(),
            phase: state.phase,
            recording: self.recorder.is_recording(guild).await,
            broadcasting: self.broadcaster.is_broadcasting(guild),
            speakers: state
                .multiplexer
                .as_ref()
                .map(|m| m.subscription_count())
                .unwrap_or(0),
            created_at: state.created_at.unwrap_or_else(Utc::now),
        })
    }

    pub async fn phase(&self, guild: GuildId) -> SessionPhase {
        let slot = self.guild(guild);
        let phase = slot.lock().await.phase;
        phase
    }

    /// Stop everything in every guild; recordings in progress are discarded
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = lock(&self.guilds).keys().copied().collect();
        info!("Shutting down {} guild session(s)", guilds.len());

        for guild in guilds {
            let slot = self.guild(guild);
            let mut state = slot.lock().await;
            self.force_stop(guild, &mut state).await;
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionLost { guild, connection } => {
                let slot = self.guild(guild);
                let mut state = slot.lock().await;
                if state.connection != Some(connection) {
                    debug!(
                        "Guild {}: ignoring loss of stale connection {}",
                        guild, connection
                    );
                    return;
                }
                warn!(
                    "Guild {}: connection {} lost, stopping all capture",
                    guild, connection
                );
                state.phase = SessionPhase::Error;
                self.force_stop(guild, &mut state).await;
            }
            SessionEvent::BroadcastIdle { guild, session } => {
                let slot = self.guild(guild);
                let mut state = slot.lock().await;
                if self.broadcaster.stop_if_idle(guild, session).await.is_some() {
                    if let Some(mux) = &state.multiplexer {
                        mux.remove_sink(SinkKind::Broadcast);
                    }
                    self.settle(guild, &mut state).await;
                }
            }
        }
    }

    /// Obtain a ready connection to `channel`, replacing a session bound elsewhere
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        state: &mut GuildState,
    ) -> Result<Arc<dyn VoiceConnection>> {
        let stale = match self.registry.current(guild).await {
            Some((id, existing)) => {
                if existing.channel_id() != channel || !existing.state().is_live() {
                    info!(
                        "Guild {}: moving session from channel {} to {}",
                        guild,
                        existing.channel_id(),
                        channel
                    );
                    true
                } else if state.connection != Some(id) {
                    warn!(
                        "Guild {}: connection {} is not the one capture runs on, restarting",
                        guild, id
                    );
                    true
                } else {
                    false
                }
            }
            None => {
                // The connection went away before its loss report was handled
                let leftover = state.connection.is_some()
                    || state.multiplexer.is_some()
                    || self.recorder.is_recording(guild).await
                    || self.broadcaster.is_broadcasting(guild);
                if leftover {
                    warn!(
                        "Guild {}: connection already gone, clearing leftover capture",
                        guild
                    );
                }
                leftover
            }
        };

        if stale {
            self.force_stop(guild, state).await;
        }

        let fresh = self.registry.get(guild).await.is_none();
        if fresh {
            state.phase = SessionPhase::Connecting;
        }

        match self.registry.join(guild, channel).await {
            Ok((id, conn)) => {
                if fresh {
                    state.created_at = Some(Utc::now());
                }
                state.connection = Some(id);
                Ok(conn)
            }
            Err(e) => {
                error!("Guild {}: failed to join channel {}: {}", guild, channel, e);
                state.phase = SessionPhase::Error;
                self.settle(guild, state).await;
                Err(e)
            }
        }
    }

    /// Resolve the phase from what is still active, releasing the connection
    /// once nothing is
    async fn settle(&self, guild: GuildId, state: &mut GuildState) {
        let recording = self.recorder.is_recording(guild).await;
        let broadcasting = self.broadcaster.is_broadcasting(guild);

        if recording || broadcasting {
            state.phase = SessionPhase::Active;
            return;
        }

        if let Some(mux) = state.multiplexer.take() {
            mux.detach();
        }
        self.registry.teardown(guild).await;
        state.connection = None;
        state.created_at = None;
        state.phase = SessionPhase::Idle;
    }

    /// Unconditional cleanup: discard the recording, close every listener,
    /// destroy the connection
    async fn force_stop(&self, guild: GuildId, state: &mut GuildState) {
        if state.phase != SessionPhase::Error {
            state.phase = SessionPhase::Stopping;
        }

        if let Some(mux) = state.multiplexer.take() {
            mux.detach();
        }
        if self.recorder.stop(guild, true).await.is_some() {
            info!("Guild {}: active recording discarded", guild);
        }
        self.broadcaster.stop(guild).await;
        self.registry.teardown(guild).await;

        state.connection = None;
        state.created_at = None;
        state.phase = SessionPhase::Idle;
    }
}

fn attach(
    state: &mut GuildState,
    guild: GuildId,
    conn: Arc<dyn VoiceConnection>,
    sink: Arc<dyn Sink>,
) {
    state
        .multiplexer
        .get_or_insert_with(|| SpeakerMultiplexer::new(guild))
        .attach(conn, vec![sink]);
}

async fn run_events(
    orchestrator: Weak<SessionOrchestrator>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        // A slow guild must not hold up events for the others
        tokio::spawn(async move {
            orchestrator.handle_event(event).await;
        });
    }
}
