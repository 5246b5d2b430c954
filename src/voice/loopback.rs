//! In-process voice transport
//!
//! `LoopbackGateway` stands in for the chat platform's voice SDK. Connections
//! become ready on their own (unless told to stall) and expose hooks to drive
//! speaking signals, audio chunks and state transitions by hand. The test
//! suite and the demo server use it.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::connection::{
    AudioStream, ChannelId, ConnectionState, GuildId, ParticipantId, VoiceConnection, VoiceGateway,
};
use crate::error::{Result, VoiceError};
use crate::sync::lock;

/// Chunks buffered per participant stream
const STREAM_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct LoopbackGateway {
    inner: Arc<GatewayInner>,
}

#[derive(Default)]
struct GatewayInner {
    stall: AtomicBool,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep new connections in `Connecting` instead of reaching `Ready`
    pub fn stall_connections(&self, stall: bool) {
        self.inner.stall.store(stall, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Most recent connection made for this guild and channel
    pub fn connection(&self, guild: GuildId, channel: ChannelId) -> Option<Arc<LoopbackConnection>> {
        lock(&self.inner.connections)
            .iter()
            .rev()
            .find(|c| c.guild == guild && c.channel == channel)
            .cloned()
    }

    /// Most recent connection made for this guild
    pub fn latest(&self, guild: GuildId) -> Option<Arc<LoopbackConnection>> {
        lock(&self.inner.connections)
            .iter()
            .rev()
            .find(|c| c.guild == guild)
            .cloned()
    }
}

#[async_trait]
impl VoiceGateway for LoopbackGateway {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let conn = Arc::new(LoopbackConnection::new(guild, channel));
        lock(&self.inner.connections).push(Arc::clone(&conn));

        if !self.inner.stall.load(Ordering::SeqCst) {
            let handshake = Arc::clone(&conn);
            tokio::spawn(async move {
                handshake.set_state(ConnectionState::Connecting);
                tokio::task::yield_now().await;
                handshake.set_state(ConnectionState::Ready);
            });
        } else {
            conn.set_state(ConnectionState::Connecting);
        }

        Ok(conn)
    }
}

pub struct LoopbackConnection {
    guild: GuildId,
    channel: ChannelId,
    state_tx: watch::Sender<ConnectionState>,
    speaking_listeners: Mutex<Vec<mpsc::UnboundedSender<ParticipantId>>>,
    streams: Mutex<HashMap<ParticipantId, mpsc::Sender<std::io::Result<Bytes>>>>,
    subscribes: AtomicUsize,
    destroys: AtomicUsize,
}

impl LoopbackConnection {
    fn new(guild: GuildId, channel: ChannelId) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Signalling);
        Self {
            guild,
            channel,
            state_tx,
            speaking_listeners: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            subscribes: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        debug!("Loopback guild {}: state -> {:?}", self.guild, state);
        self.state_tx.send_replace(state);
    }

    /// Fire the "speaking started" signal for a participant
    pub fn start_speaking(&self, participant: ParticipantId) {
        lock(&self.speaking_listeners).retain(|tx| tx.send(participant).is_ok());
    }

    /// Emit one audio chunk on the participant's open stream.
    ///
    /// Returns false if nobody is subscribed to that participant.
    pub async fn push_audio(&self, participant: ParticipantId, chunk: impl Into<Bytes>) -> bool {
        let tx = lock(&self.streams).get(&participant).cloned();
        match tx {
            Some(tx) => tx.send(Ok(chunk.into())).await.is_ok(),
            None => false,
        }
    }

    /// End the participant's stream naturally
    pub fn end_stream(&self, participant: ParticipantId) {
        lock(&self.streams).remove(&participant);
    }

    /// Fail the participant's stream
    pub async fn fail_stream(&self, participant: ParticipantId) {
        let tx = lock(&self.streams).remove(&participant);
        if let Some(tx) = tx {
            let _ = tx
                .send(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "decoder failure",
                )))
                .await;
        }
    }

    /// Whether the participant's stream is still held open by a consumer
    pub fn is_streaming(&self, participant: ParticipantId) -> bool {
        lock(&self.streams)
            .get(&participant)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for LoopbackConnection {
    fn guild_id(&self) -> GuildId {
        self.guild
    }

    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn speaking_events(&self) -> mpsc::UnboundedReceiver<ParticipantId> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.speaking_listeners).push(tx);
        rx
    }

    async fn subscribe(&self, participant: ParticipantId) -> Result<AudioStream> {
        if self.state() == ConnectionState::Destroyed {
            return Err(VoiceError::Subscription(format!(
                "connection for guild {} is destroyed",
                self.guild
            )));
        }

        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        lock(&self.streams).insert(participant, tx);
        Ok(rx)
    }

    async fn destroy(&self) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        lock(&self.speaking_listeners).clear();
        lock(&self.streams).clear();
        self.set_state(ConnectionState::Destroyed);
        Ok(())
    }
}
