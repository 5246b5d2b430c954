use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::listener::{ListenerSink, ListenerStream};
use super::session::{BroadcastSession, ListenerId};
use crate::capture::Sink;
use crate::config::BroadcastConfig;
use crate::error::{Result, VoiceError};
use crate::session::SessionEvent;
use crate::sync::lock;
use crate::voice::GuildId;

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub is_streaming: bool,
    pub listener_count: usize,
}

/// Live broadcast sessions, at most one per guild
pub struct LiveBroadcaster {
    config: BroadcastConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    sessions: Mutex<HashMap<GuildId, Arc<BroadcastSession>>>,
}

impl LiveBroadcaster {
    pub fn new(config: BroadcastConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open an empty broadcast. The returned session is the sink to attach
    /// to the guild's multiplexer.
    pub fn start(&self, guild: GuildId) -> Result<Arc<BroadcastSession>> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&guild) {
            return Err(VoiceError::AlreadyBroadcasting(guild));
        }

        let session = BroadcastSession::new(guild, self.config.grace(), self.events.clone());
        sessions.insert(guild, Arc::clone(&session));
        info!("Guild {}: live broadcast started", guild);
        Ok(session)
    }

    pub fn session(&self, guild: GuildId) -> Option<Arc<BroadcastSession>> {
        lock(&self.sessions).get(&guild).cloned()
    }

    pub fn is_broadcasting(&self, guild: GuildId) -> bool {
        lock(&self.sessions).contains_key(&guild)
    }

    /// Add any sink as a listener of the guild's broadcast
    pub fn add_listener(&self, guild: GuildId, sink: Arc<dyn Sink>) -> Result<ListenerId> {
        let session = self
            .session(guild)
            .ok_or(VoiceError::NoActiveBroadcast(guild))?;
        Ok(session.add_listener(sink))
    }

    /// Connect a remote listener and hand back its byte stream
    pub fn open_listener(&self, guild: GuildId) -> Result<ListenerStream> {
        let session = self
            .session(guild)
            .ok_or(VoiceError::NoActiveBroadcast(guild))?;

        let (sink, rx) = ListenerSink::channel(self.config.listener_buffer);
        let id = session.add_listener(Arc::new(sink));
        Ok(ListenerStream::new(rx, Arc::downgrade(&session), id))
    }

    pub fn remove_listener(&self, guild: GuildId, id: ListenerId) -> bool {
        match self.session(guild) {
            Some(session) => session.remove_listener(id),
            None => false,
        }
    }

    /// End the guild's broadcast, closing every listener
    pub async fn stop(&self, guild: GuildId) -> Option<Arc<BroadcastSession>> {
        let session = lock(&self.sessions).remove(&guild)?;

        if let Err(e) = session.close().await {
            warn!("Guild {}: failed to close broadcast: {}", guild, e);
        }
        info!("Guild {}: live broadcast stopped", guild);
        Some(session)
    }

    /// Remove the broadcast only if it is still `session` and still has no
    /// listeners; used when a grace window expires.
    pub async fn stop_if_idle(&self, guild: GuildId, session: Uuid) -> Option<Arc<BroadcastSession>> {
        let idle = {
            let mut sessions = lock(&self.sessions);
            let matches = sessions
                .get(&guild)
                .map(|s| s.id() == session && s.listener_count() == 0)
                .unwrap_or(false);
            if matches {
                sessions.remove(&guild)
            } else {
                None
            }
        }?;

        if let Err(e) = idle.close().await {
            warn!("Guild {}: failed to close broadcast: {}", guild, e);
        }
        info!("Guild {}: idle live broadcast released", guild);
        Some(idle)
    }

    pub fn status(&self, guild: GuildId) -> LiveStatus {
        match self.session(guild) {
            Some(session) => LiveStatus {
                is_streaming: true,
                listener_count: session.listener_count(),
            },
            None => LiveStatus {
                is_streaming: false,
                listener_count: 0,
            },
        }
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        lock(&self.sessions).keys().copied().collect()
    }
}
