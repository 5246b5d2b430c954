use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{Sink, SinkKind};
use crate::error::Result;
use crate::session::SessionEvent;
use crate::sync::lock;
use crate::voice::GuildId;

pub type ListenerId = Uuid;

/// The live broadcast of one guild: the sink the multiplexer feeds, fanning
/// every chunk out to the current listeners.
pub struct BroadcastSession {
    this: Weak<BroadcastSession>,
    guild: GuildId,
    id: Uuid,
    started_at: DateTime<Utc>,
    grace: Duration,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Sink>)>>,
    pending_teardown: Mutex<Option<(u64, JoinHandle<()>)>>,
    teardown_generation: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl BroadcastSession {
    pub(super) fn new(
        guild: GuildId,
        grace: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            guild,
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            grace,
            listeners: Mutex::new(Vec::new()),
            pending_teardown: Mutex::new(None),
            teardown_generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn guild(&self) -> GuildId {
        self.guild
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn has_pending_teardown(&self) -> bool {
        lock(&self.pending_teardown).is_some()
    }

    /// Join a listener; cancels a scheduled teardown
    pub fn add_listener(&self, sink: Arc<dyn Sink>) -> ListenerId {
        let id = Uuid::new_v4();
        let count = {
            let mut listeners = lock(&self.listeners);
            listeners.push((id, sink));
            listeners.len()
        };

        if self.cancel_teardown() {
            info!("Guild {}: listener rejoined, teardown cancelled", self.guild);
        }
        info!("Guild {}: listener {} joined ({} total)", self.guild, id, count);
        id
    }

    /// Drop a listener; an emptied set schedules the deferred teardown
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (removed, now_empty) = {
            let mut listeners = lock(&self.listeners);
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            (listeners.len() != before, listeners.is_empty())
        };

        if removed {
            info!("Guild {}: listener {} left", self.guild, id);
            if now_empty {
                self.schedule_teardown();
            }
        }
        removed
    }

    fn schedule_teardown(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Guild {}: no runtime to schedule broadcast teardown", self.guild);
            return;
        };

        let generation = self.teardown_generation.fetch_add(1, Ordering::SeqCst);
        let session = self.this.clone();
        let grace = self.grace;
        let mut pending = lock(&self.pending_teardown);
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;

            let Some(session) = session.upgrade() else {
                return;
            };
            {
                let mut pending = lock(&session.pending_teardown);
                match pending.as_ref() {
                    Some((g, _)) if *g == generation => {
                        pending.take();
                    }
                    _ => return,
                }
            }

            if session.listener_count() == 0 {
                info!(
                    "Guild {}: no listeners for {:?}, releasing broadcast",
                    session.guild, grace
                );
                let _ = session.events.send(SessionEvent::BroadcastIdle {
                    guild: session.guild,
                    session: session.id,
                });
            } else {
                debug!("Guild {}: listeners returned, keeping broadcast", session.guild);
            }
        });

        if let Some((_, previous)) = pending.replace((generation, task)) {
            previous.abort();
        }
        debug!("Guild {}: teardown scheduled in {:?}", self.guild, grace);
    }

    fn cancel_teardown(&self) -> bool {
        match lock(&self.pending_teardown).take() {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Sink for BroadcastSession {
    fn kind(&self) -> SinkKind {
        SinkKind::Broadcast
    }

    async fn write(&self, chunk: Bytes) -> Result<()> {
        let listeners: Vec<(ListenerId, Arc<dyn Sink>)> = lock(&self.listeners).clone();
        let mut failed = Vec::new();

        for (id, sink) in &listeners {
            if let Err(e) = sink.write(chunk.clone()).await {
                debug!("Guild {}: listener {} write failed: {}", self.guild, id, e);
                failed.push(*id);
            }
        }

        if !failed.is_empty() {
            let now_empty = {
                let mut current = lock(&self.listeners);
                let before = current.len();
                current.retain(|(id, _)| !failed.contains(id));
                before > 0 && current.is_empty()
            };
            info!(
                "Guild {}: removed {} unreachable listener(s)",
                self.guild,
                failed.len()
            );
            if now_empty {
                self.schedule_teardown();
            }
        }
        Ok(())
    }

    /// End the broadcast: every listener is closed and a pending teardown dropped
    async fn close(&self) -> Result<()> {
        self.cancel_teardown();
        let listeners: Vec<_> = lock(&self.listeners).drain(..).collect();

        for (id, sink) in &listeners {
            if let Err(e) = sink.close().await {
                warn!("Guild {}: failed to close listener {}: {}", self.guild, id, e);
            }
        }
        info!(
            "Guild {}: broadcast closed ({} listeners disconnected)",
            self.guild,
            listeners.len()
        );
        Ok(())
    }
}
