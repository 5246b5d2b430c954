use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::connection::{ChannelId, ConnectionState, GuildId, VoiceConnection, VoiceGateway};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::session::SessionEvent;

/// Registry-assigned identity of one connection, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
struct Registered {
    id: ConnectionId,
    conn: Arc<dyn VoiceConnection>,
}

type ConnectionMap = Arc<Mutex<HashMap<GuildId, Registered>>>;

/// Owns at most one voice connection per guild.
///
/// The map entry is the single source of truth for "this connection is still
/// ours": whoever removes it performs the cleanup, so a connection loss is
/// reported at most once no matter how the terminal state was reached. Loss
/// reports carry the connection's id so consumers can ignore stale ones.
pub struct VoiceConnectionRegistry {
    gateway: Arc<dyn VoiceGateway>,
    config: VoiceConfig,
    connections: ConnectionMap,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl VoiceConnectionRegistry {
    pub fn new(
        gateway: Arc<dyn VoiceGateway>,
        config: VoiceConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            gateway,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Join for a capture session (recording or broadcast)
    pub async fn join(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<(ConnectionId, Arc<dyn VoiceConnection>)> {
        self.join_with_timeout(guild, channel, self.config.join_timeout())
            .await
    }

    /// Join for playback only, with the shorter ready wait
    pub async fn join_for_playback(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<(ConnectionId, Arc<dyn VoiceConnection>)> {
        self.join_with_timeout(guild, channel, self.config.playback_join_timeout())
            .await
    }

    /// Reuse the live connection to `channel`, or replace whatever exists with a new one
    pub async fn join_with_timeout(
        &self,
        guild: GuildId,
        channel: ChannelId,
        ready_timeout: Duration,
    ) -> Result<(ConnectionId, Arc<dyn VoiceConnection>)> {
        let existing = self.connections.lock().await.get(&guild).cloned();

        if let Some(Registered { id, conn }) = existing {
            if conn.state().is_live() && conn.channel_id() == channel {
                debug!("Guild {}: reusing voice connection {} to channel {}", guild, id, channel);
                return Ok((id, conn));
            }

            info!(
                "Guild {}: replacing voice connection {} (channel {} -> {})",
                guild,
                id,
                conn.channel_id(),
                channel
            );
            self.teardown(guild).await;
        }

        info!("Guild {}: joining voice channel {}", guild, channel);
        let conn = self.gateway.connect(guild, channel).await?;
        let mut state_rx = conn.state_changes();
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.connections.lock().await.insert(
            guild,
            Registered {
                id,
                conn: Arc::clone(&conn),
            },
        );

        let ready = match timeout(
            ready_timeout,
            state_rx.wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Destroyed)),
        )
        .await
        {
            Ok(Ok(state)) => *state == ConnectionState::Ready,
            _ => false,
        };

        if !ready {
            warn!(
                "Guild {}: voice connection not ready after {:?}, rolling back",
                guild, ready_timeout
            );
            if remove_if_current(&self.connections, guild, id).await {
                destroy_quietly(guild, conn.as_ref()).await;
            }
            return Err(VoiceError::ConnectionTimeout {
                guild,
                timeout_secs: ready_timeout.as_secs(),
            });
        }

        info!("Guild {}: voice connection {} ready on channel {}", guild, id, channel);
        self.spawn_watcher(guild, id, Arc::clone(&conn), state_rx);

        Ok((id, conn))
    }

    pub async fn get(&self, guild: GuildId) -> Option<Arc<dyn VoiceConnection>> {
        self.connections.lock().await.get(&guild).map(|r| Arc::clone(&r.conn))
    }

    /// The registered connection together with its id
    pub async fn current(&self, guild: GuildId) -> Option<(ConnectionId, Arc<dyn VoiceConnection>)> {
        self.connections
            .lock()
            .await
            .get(&guild)
            .map(|r| (r.id, Arc::clone(&r.conn)))
    }

    /// Destroy and forget the guild's connection. Safe to call when absent.
    pub async fn teardown(&self, guild: GuildId) {
        let removed = self.connections.lock().await.remove(&guild);

        if let Some(Registered { id, conn }) = removed {
            info!("Guild {}: tearing down voice connection {}", guild, id);
            destroy_quietly(guild, conn.as_ref()).await;
        }
    }

    /// Guilds with a registered connection
    pub async fn guilds(&self) -> Vec<GuildId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Follow the connection's state until it is gone for good
    fn spawn_watcher(
        &self,
        guild: GuildId,
        id: ConnectionId,
        conn: Arc<dyn VoiceConnection>,
        mut state_rx: watch::Receiver<ConnectionState>,
    ) {
        let connections = Arc::clone(&self.connections);
        let events = self.events.clone();
        let reconnect_window = self.config.reconnect_window();

        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    debug!("Guild {}: connection state source closed", guild);
                    break;
                }

                let mut state = *state_rx.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    // Anything but another Disconnected ends the window early
                    let next = timeout(
                        reconnect_window,
                        state_rx.wait_for(|s| *s != ConnectionState::Disconnected),
                    )
                    .await
                    .ok()
                    .and_then(|r| r.ok().map(|s| *s));

                    match next {
                        Some(ConnectionState::Destroyed) => state = ConnectionState::Destroyed,
                        Some(_) => {
                            info!("Guild {}: voice connection {} is reconnecting", guild, id);
                            continue;
                        }
                        None => {
                            warn!(
                                "Guild {}: voice connection {} did not recover within {:?}",
                                guild, id, reconnect_window
                            );
                            if remove_if_current(&connections, guild, id).await {
                                destroy_quietly(guild, conn.as_ref()).await;
                                let _ = events.send(SessionEvent::ConnectionLost {
                                    guild,
                                    connection: id,
                                });
                            }
                            break;
                        }
                    }
                }

                if state == ConnectionState::Destroyed {
                    if remove_if_current(&connections, guild, id).await {
                        warn!("Guild {}: voice connection {} destroyed", guild, id);
                        let _ = events.send(SessionEvent::ConnectionLost {
                            guild,
                            connection: id,
                        });
                    }
                    break;
                }
            }
        });
    }
}

async fn remove_if_current(connections: &ConnectionMap, guild: GuildId, id: ConnectionId) -> bool {
    let mut map = connections.lock().await;
    let is_current = map.get(&guild).map(|r| r.id == id).unwrap_or(false);

    if is_current {
        map.remove(&guild);
    }
    is_current
}

pub(crate) fn same_connection(a: &Arc<dyn VoiceConnection>, b: &Arc<dyn VoiceConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn destroy_quietly(guild: GuildId, conn: &dyn VoiceConnection) {
    if let Err(e) = conn.destroy().await {
        warn!("Guild {}: failed to destroy voice connection: {}", guild, e);
    }
}
