use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capture::{Sink, SinkKind};
use crate::error::{Result, VoiceError};
use crate::sync::lock;
use crate::voice::GuildId;

/// Chunks queued for the writer before `write` starts waiting
const WRITE_QUEUE: usize = 512;

/// Appends forwarded audio to the raw capture file.
///
/// A writer task owns the file handle; `close` drops the queue and waits
/// (bounded) for the writer to flush and acknowledge.
pub struct FileSink {
    guild: GuildId,
    path: PathBuf,
    close_timeout: Duration,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    bytes_written: Arc<AtomicU64>,
}

impl FileSink {
    /// Create (truncating) the raw file and start its writer
    pub async fn create(guild: GuildId, path: &Path, close_timeout: Duration) -> Result<Self> {
        let file = File::create(path).await?;
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let bytes_written = Arc::new(AtomicU64::new(0));

        let writer = tokio::spawn(write_raw(
            BufWriter::new(file),
            rx,
            Arc::clone(&bytes_written),
        ));

        debug!("Guild {}: raw capture file {}", guild, path.display());

        Ok(Self {
            guild,
            path: path.to_path_buf(),
            close_timeout,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            bytes_written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes the writer has handed to the file so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Recording
    }

    async fn write(&self, chunk: Bytes) -> Result<()> {
        let tx = lock(&self.tx).clone();
        let tx = tx.ok_or_else(|| {
            VoiceError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "recording closed"))
        })?;

        tx.send(chunk).await.map_err(|_| {
            VoiceError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "recording writer stopped"))
        })
    }

    async fn close(&self) -> Result<()> {
        lock(&self.tx).take();
        let writer = lock(&self.writer).take();

        let Some(writer) = writer else {
            return Ok(());
        };

        match tokio::time::timeout(self.close_timeout, writer).await {
            Ok(Ok(Ok(()))) => {
                debug!(
                    "Guild {}: raw capture closed ({} bytes)",
                    self.guild,
                    self.bytes_written()
                );
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!("Guild {}: raw capture writer failed: {}", self.guild, e);
                Err(e.into())
            }
            Ok(Err(e)) => {
                warn!("Guild {}: raw capture writer panicked: {}", self.guild, e);
                Err(VoiceError::Other(e.into()))
            }
            Err(_) => {
                warn!(
                    "Guild {}: raw capture close not acknowledged within {:?}",
                    self.guild, self.close_timeout
                );
                Ok(())
            }
        }
    }
}

async fn write_raw(
    mut file: BufWriter<File>,
    mut rx: mpsc::Receiver<Bytes>,
    bytes_written: Arc<AtomicU64>,
) -> io::Result<()> {
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
        bytes_written.fetch_add(chunk.len() as u64, Ordering::SeqCst);
    }

    file.flush().await?;
    file.into_inner().sync_all().await
}
