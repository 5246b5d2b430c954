// Speaker multiplexer
//
// Subscribes lazily to each participant's raw audio once they start talking
// and forwards every chunk to the registered sinks. One forwarding task runs
// per participant, so per-participant order is preserved while chunks from
// different speakers interleave as they arrive.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sink::{Sink, SinkKind};
use crate::sync::{lock, read, write};
use crate::voice::{same_connection, AudioStream, GuildId, ParticipantId, VoiceConnection};

/// One open per-participant audio stream
struct SpeakerSubscription {
    generation: u64,
    attached_at: DateTime<Utc>,
    /// Owns the raw stream; aborting it drops (and so destroys) the stream
    forwarder: JoinHandle<()>,
}

struct Shared {
    guild: GuildId,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    subscriptions: Mutex<HashMap<ParticipantId, SpeakerSubscription>>,
    torn_down: AtomicBool,
    next_generation: AtomicU64,
}

pub struct SpeakerMultiplexer {
    shared: Arc<Shared>,
    connection: Mutex<Option<Arc<dyn VoiceConnection>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerMultiplexer {
    pub fn new(guild: GuildId) -> Self {
        Self {
            shared: Arc::new(Shared {
                guild,
                sinks: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
                torn_down: AtomicBool::new(true),
                next_generation: AtomicU64::new(0),
            }),
            connection: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Forward the connection's speakers to `sinks`.
    ///
    /// Attaching again to the same connection only registers the sinks (a sink
    /// replaces any registered sink of the same kind). Attaching to a different
    /// connection detaches from the old one first.
    pub fn attach(&self, connection: Arc<dyn VoiceConnection>, sinks: Vec<Arc<dyn Sink>>) {
        let bound = lock(&self.connection).clone();
        let same = bound
            .as_ref()
            .map(|c| same_connection(c, &connection))
            .unwrap_or(false);

        if !same {
            if bound.is_some() {
                self.detach();
            }
            self.listen(connection);
        }

        let mut registered = write(&self.shared.sinks);
        for sink in sinks {
            registered.retain(|s| s.kind() != sink.kind());
            debug!("Guild {}: {:?} sink attached", self.shared.guild, sink.kind());
            registered.push(sink);
        }
    }

    /// Stop feeding one consumer; other sinks keep receiving
    pub fn remove_sink(&self, kind: SinkKind) -> Option<Arc<dyn Sink>> {
        let mut registered = write(&self.shared.sinks);
        let pos = registered.iter().position(|s| s.kind() == kind)?;
        debug!("Guild {}: {:?} sink removed", self.shared.guild, kind);
        Some(registered.remove(pos))
    }

    pub fn has_sinks(&self) -> bool {
        !read(&self.shared.sinks).is_empty()
    }

    pub fn is_attached(&self) -> bool {
        !self.shared.torn_down.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// When each current speaker was first subscribed
    pub fn speakers(&self) -> Vec<(ParticipantId, DateTime<Utc>)> {
        lock(&self.shared.subscriptions)
            .iter()
            .map(|(p, s)| (*p, s.attached_at))
            .collect()
    }

    /// Drop the speaking listener, destroy every open stream and forget all
    /// sinks. Safe to call repeatedly.
    pub fn detach(&self) {
        let was_attached = !self.shared.torn_down.swap(true, Ordering::SeqCst);

        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        lock(&self.connection).take();

        let subscriptions: Vec<_> = lock(&self.shared.subscriptions).drain().collect();
        for (participant, sub) in &subscriptions {
            debug!(
                "Guild {}: closing audio stream of {}",
                self.shared.guild, participant
            );
            sub.forwarder.abort();
        }
        write(&self.shared.sinks).clear();

        if was_attached {
            info!(
                "Guild {}: multiplexer detached ({} streams closed)",
                self.shared.guild,
                subscriptions.len()
            );
        }
    }

    fn listen(&self, connection: Arc<dyn VoiceConnection>) {
        self.shared.torn_down.store(false, Ordering::SeqCst);
        let speaking = connection.speaking_events();
        *lock(&self.connection) = Some(Arc::clone(&connection));

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_listener(shared, connection, speaking));
        *lock(&self.listener) = Some(handle);

        info!("Guild {}: multiplexer attached", self.shared.guild);
    }
}

impl Drop for SpeakerMultiplexer {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Consume "speaking started" signals one at a time
async fn run_listener(
    shared: Arc<Shared>,
    connection: Arc<dyn VoiceConnection>,
    mut speaking: mpsc::UnboundedReceiver<ParticipantId>,
) {
    while let Some(participant) = speaking.recv().await {
        if shared.torn_down.load(Ordering::SeqCst) {
            break;
        }
        if lock(&shared.subscriptions).contains_key(&participant) {
            debug!(
                "Guild {}: {} already subscribed",
                shared.guild, participant
            );
            continue;
        }

        let stream = match connection.subscribe(participant).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Guild {}: failed to subscribe to {}: {}",
                    shared.guild, participant, e
                );
                continue;
            }
        };

        let mut subscriptions = lock(&shared.subscriptions);
        if shared.torn_down.load(Ordering::SeqCst) {
            break;
        }

        let generation = shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let forwarder = tokio::spawn(forward(
            Arc::clone(&shared),
            participant,
            generation,
            stream,
        ));
        subscriptions.insert(
            participant,
            SpeakerSubscription {
                generation,
                attached_at: Utc::now(),
                forwarder,
            },
        );
        info!("Guild {}: subscribed to {}", shared.guild, participant);
    }

    debug!("Guild {}: speaking listener finished", shared.guild);
}

/// Copy one participant's chunks to every registered sink, in order
async fn forward(
    shared: Arc<Shared>,
    participant: ParticipantId,
    generation: u64,
    mut stream: AudioStream,
) {
    while let Some(item) = stream.recv().await {
        let chunk: Bytes = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    "Guild {}: audio stream of {} failed: {}",
                    shared.guild, participant, e
                );
                break;
            }
        };

        let sinks: Vec<Arc<dyn Sink>> = read(&shared.sinks).clone();
        for sink in sinks {
            if let Err(e) = sink.write(chunk.clone()).await {
                warn!(
                    "Guild {}: {:?} sink rejected chunk: {}",
                    shared.guild,
                    sink.kind(),
                    e
                );
            }
        }
    }

    let mut subscriptions = lock(&shared.subscriptions);
    if subscriptions
        .get(&participant)
        .map(|s| s.generation == generation)
        .unwrap_or(false)
    {
        subscriptions.remove(&participant);
        debug!(
            "Guild {}: audio stream of {} ended",
            shared.guild, participant
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::voice::{ChannelId, LoopbackConnection, LoopbackGateway, VoiceGateway};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CollectingSink {
        kind: SinkKind,
        chunks: Mutex<Vec<Bytes>>,
    }

    impl CollectingSink {
        fn new(kind: SinkKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                chunks: Mutex::new(Vec::new()),
            })
        }

        fn chunks(&self) -> Vec<Bytes> {
            lock(&self.chunks).clone()
        }
    }

    #[async_trait]
    impl Sink for CollectingSink {
        fn kind(&self) -> SinkKind {
            self.kind
        }

        async fn write(&self, chunk: Bytes) -> Result<()> {
            lock(&self.chunks).push(chunk);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn connect() -> (Arc<dyn VoiceConnection>, Arc<LoopbackConnection>) {
        let gateway = LoopbackGateway::new();
        let conn = gateway.connect(GuildId(1), ChannelId(1)).await.unwrap();
        let handle = gateway.latest(GuildId(1)).unwrap();
        (conn, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_duplicate_speaking_signal_subscribes_once() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        let sink = CollectingSink::new(SinkKind::Recording);
        mux.attach(conn, vec![sink.clone()]);

        handle.start_speaking(ParticipantId(7));
        handle.start_speaking(ParticipantId(7));
        settle().await;

        assert_eq!(handle.subscribe_count(), 1);
        assert_eq!(mux.subscription_count(), 1);
        assert_eq!(mux.speakers()[0].0, ParticipantId(7));

        assert!(handle.push_audio(ParticipantId(7), vec![1u8, 2]).await);
        settle().await;
        assert_eq!(sink.chunks(), vec![Bytes::from_static(&[1, 2])]);
    }

    #[tokio::test]
    async fn test_per_participant_order_preserved_across_sinks() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        let recording = CollectingSink::new(SinkKind::Recording);
        let broadcast = CollectingSink::new(SinkKind::Broadcast);
        mux.attach(conn, vec![recording.clone(), broadcast.clone()]);

        handle.start_speaking(ParticipantId(1));
        handle.start_speaking(ParticipantId(2));
        settle().await;

        for i in 0..10u8 {
            handle.push_audio(ParticipantId(1), vec![i]).await;
            handle.push_audio(ParticipantId(2), vec![100 + i]).await;
        }
        settle().await;

        for sink in [&recording, &broadcast] {
            let chunks = sink.chunks();
            assert_eq!(chunks.len(), 20);
            let first: Vec<u8> = chunks.iter().map(|c| c[0]).filter(|b| *b < 100).collect();
            let second: Vec<u8> = chunks.iter().map(|c| c[0]).filter(|b| *b >= 100).collect();
            assert_eq!(first, (0..10).collect::<Vec<u8>>());
            assert_eq!(second, (100..110).collect::<Vec<u8>>());
        }
    }

    #[tokio::test]
    async fn test_stream_end_allows_resubscribe() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        mux.attach(conn, vec![CollectingSink::new(SinkKind::Recording)]);

        handle.start_speaking(ParticipantId(3));
        settle().await;
        handle.end_stream(ParticipantId(3));
        settle().await;
        assert_eq!(mux.subscription_count(), 0);

        handle.start_speaking(ParticipantId(3));
        settle().await;
        assert_eq!(handle.subscribe_count(), 2);
        assert_eq!(mux.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_is_isolated() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        let sink = CollectingSink::new(SinkKind::Recording);
        mux.attach(conn, vec![sink.clone()]);

        handle.start_speaking(ParticipantId(1));
        handle.start_speaking(ParticipantId(2));
        settle().await;

        handle.fail_stream(ParticipantId(1)).await;
        settle().await;
        assert_eq!(mux.subscription_count(), 1);

        handle.push_audio(ParticipantId(2), vec![9u8]).await;
        settle().await;
        assert_eq!(sink.chunks(), vec![Bytes::from_static(&[9])]);
    }

    #[tokio::test]
    async fn test_detach_closes_streams_and_is_repeatable() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        mux.attach(conn, vec![CollectingSink::new(SinkKind::Broadcast)]);

        handle.start_speaking(ParticipantId(4));
        settle().await;
        assert!(handle.is_streaming(ParticipantId(4)));

        mux.detach();
        mux.detach();
        settle().await;

        assert!(!mux.is_attached());
        assert!(!mux.has_sinks());
        assert_eq!(mux.subscription_count(), 0);
        assert!(!handle.is_streaming(ParticipantId(4)));

        handle.start_speaking(ParticipantId(5));
        settle().await;
        assert_eq!(handle.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_sink_keeps_other_consumer() {
        let (conn, handle) = connect().await;
        let mux = SpeakerMultiplexer::new(GuildId(1));
        let recording = CollectingSink::new(SinkKind::Recording);
        let broadcast = CollectingSink::new(SinkKind::Broadcast);
        mux.attach(conn, vec![recording.clone(), broadcast.clone()]);

        handle.start_speaking(ParticipantId(1));
        settle().await;
        assert!(mux.remove_sink(SinkKind::Recording).is_some());

        handle.push_audio(ParticipantId(1), vec![5u8]).await;
        settle().await;

        assert!(recording.chunks().is_empty());
        assert_eq!(broadcast.chunks().len(), 1);
        assert!(mux.remove_sink(SinkKind::Recording).is_none());
    }
}
