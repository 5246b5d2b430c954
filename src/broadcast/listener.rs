use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use super::session::{BroadcastSession, ListenerId};
use crate::capture::{Sink, SinkKind};
use crate::error::{Result, VoiceError};
use crate::sync::lock;

/// One remote listener's end of a live broadcast.
///
/// Writes never wait: a listener whose buffer is full misses the chunk. A
/// listener whose stream was dropped fails the write and gets removed.
pub struct ListenerSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ListenerSink {
    /// A sink and the receiving half handed to the remote connection
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl Sink for ListenerSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Broadcast
    }

    async fn write(&self, chunk: Bytes) -> Result<()> {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            return Err(closed());
        };

        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("Listener is behind, dropping chunk");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(closed()),
        }
    }

    async fn close(&self) -> Result<()> {
        lock(&self.tx).take();
        Ok(())
    }
}

fn closed() -> VoiceError {
    VoiceError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "listener disconnected"))
}

/// The byte stream a remote listener consumes.
///
/// Ends when the broadcast stops; dropping it leaves the broadcast.
pub struct ListenerStream {
    inner: ReceiverStream<Bytes>,
    session: Weak<BroadcastSession>,
    id: ListenerId,
}

impl ListenerStream {
    pub(super) fn new(rx: mpsc::Receiver<Bytes>, session: Weak<BroadcastSession>, id: ListenerId) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            session,
            id,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Stream for ListenerStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_listener(self.id);
        }
    }
}
