use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::file_sink::FileSink;
use super::naming::{sound_name, unique_path};
use super::transcoder::Transcoder;
use crate::capture::Sink;
use crate::config::RecordingConfig;
use crate::error::{Result, VoiceError};
use crate::sync::lock;
use crate::voice::GuildId;

/// Everything needed to finish one recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingJob {
    pub guild: GuildId,
    pub temp_dir: PathBuf,
    pub raw_path: PathBuf,
    pub final_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl RecordingJob {
    /// Name the recording is published under (file stem of the final path)
    pub fn sound_name(&self) -> String {
        self.final_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

struct ActiveRecording {
    job: RecordingJob,
    sink: Arc<FileSink>,
}

/// Tracks the active recording of each guild and finishes them
pub struct Recorder {
    config: RecordingConfig,
    transcoder: Arc<dyn Transcoder>,
    active: Mutex<HashMap<GuildId, ActiveRecording>>,
    /// Final paths promised to unfinished jobs, across all guilds
    reserved: std::sync::Mutex<HashSet<PathBuf>>,
}

impl Recorder {
    pub fn new(config: RecordingConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            config,
            transcoder,
            active: Mutex::new(HashMap::new()),
            reserved: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Open a new raw capture for the guild.
    ///
    /// The returned sink still has to be attached to the guild's multiplexer.
    pub async fn start(
        &self,
        guild: GuildId,
        name_hint: Option<&str>,
    ) -> Result<(RecordingJob, Arc<FileSink>)> {
        let mut active = self.active.lock().await;
        if active.contains_key(&guild) {
            return Err(VoiceError::AlreadyRecording(guild));
        }

        let started_at = Utc::now();
        let temp_dir = self.config.temp_path.join(format!("guild-{}", guild));
        fs::create_dir_all(&temp_dir).await?;
        fs::create_dir_all(&self.config.sounds_path).await?;

        let raw_path = temp_dir.join(format!("{}.pcm", uuid::Uuid::new_v4()));
        let name = sound_name(name_hint, self.config.max_name_len, started_at);
        // Starts are serialized by `active`, so the snapshot cannot go stale
        let taken = lock(&self.reserved).clone();
        let final_path =
            unique_path(&self.config.sounds_path, &name, &self.config.extension, &taken).await;

        let sink = Arc::new(FileSink::create(guild, &raw_path, self.config.close_timeout()).await?);
        lock(&self.reserved).insert(final_path.clone());
        let job = RecordingJob {
            guild,
            temp_dir,
            raw_path,
            final_path,
            started_at,
        };

        info!(
            "Guild {}: recording started ({})",
            guild,
            job.final_path.display()
        );
        active.insert(
            guild,
            ActiveRecording {
                job: job.clone(),
                sink: Arc::clone(&sink),
            },
        );

        Ok((job, sink))
    }

    /// Close the guild's capture.
    ///
    /// With `discard` the raw file is deleted and nothing is returned;
    /// otherwise the job is handed back for [`Recorder::transcode`].
    pub async fn stop(&self, guild: GuildId, discard: bool) -> Option<RecordingJob> {
        let recording = self.active.lock().await.remove(&guild)?;

        if let Err(e) = recording.sink.close().await {
            warn!("Guild {}: raw capture did not close cleanly: {}", guild, e);
        }
        info!(
            "Guild {}: recording stopped ({} bytes captured)",
            guild,
            recording.sink.bytes_written()
        );

        if discard {
            info!("Guild {}: discarding recording", guild);
            cleanup(&recording.job).await;
            self.release(&recording.job);
            return None;
        }
        Some(recording.job)
    }

    /// Convert a stopped job into its final file. The raw capture is removed
    /// whatever the outcome.
    pub async fn transcode(&self, job: &RecordingJob) -> Result<PathBuf> {
        let size = fs::metadata(&job.raw_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if size < self.config.min_capture_bytes {
            warn!(
                "Guild {}: only {} bytes captured, skipping transcode",
                job.guild, size
            );
            cleanup(job).await;
            self.release(job);
            return Err(VoiceError::NoAudioCaptured { bytes: size });
        }

        let result = self.transcoder.transcode(&job.raw_path, &job.final_path).await;
        cleanup(job).await;
        self.release(job);

        match result {
            Ok(()) => {
                info!(
                    "Guild {}: recording saved to {}",
                    job.guild,
                    job.final_path.display()
                );
                Ok(job.final_path.clone())
            }
            Err(e) => {
                warn!("Guild {}: transcode failed: {}", job.guild, e);
                Err(e)
            }
        }
    }

    /// From here on the final path is either on disk or free again
    fn release(&self, job: &RecordingJob) {
        lock(&self.reserved).remove(&job.final_path);
    }

    pub async fn is_recording(&self, guild: GuildId) -> bool {
        self.active.lock().await.contains_key(&guild)
    }

    pub async fn status(&self, guild: GuildId) -> RecordingStatus {
        let active = self.active.lock().await;

        match active.get(&guild) {
            Some(recording) => {
                let elapsed = Utc::now().signed_duration_since(recording.job.started_at);
                RecordingStatus {
                    is_recording: true,
                    started_at: Some(recording.job.started_at),
                    duration_secs: elapsed.num_milliseconds() as f64 / 1000.0,
                    bytes_written: recording.sink.bytes_written(),
                }
            }
            None => RecordingStatus {
                is_recording: false,
                started_at: None,
                duration_secs: 0.0,
                bytes_written: 0,
            },
        }
    }
}

/// Remove the raw file, then its directory if nothing else is in it
async fn cleanup(job: &RecordingJob) {
    match fs::remove_file(&job.raw_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Guild {}: failed to remove {}: {}",
            job.guild,
            job.raw_path.display(),
            e
        ),
    }

    match dir_is_empty(&job.temp_dir).await {
        Ok(true) => {
            if let Err(e) = fs::remove_dir(&job.temp_dir).await {
                warn!(
                    "Guild {}: failed to remove {}: {}",
                    job.guild,
                    job.temp_dir.display(),
                    e
                );
            }
        }
        Ok(false) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Guild {}: failed to inspect {}: {}",
            job.guild,
            job.temp_dir.display(),
            e
        ),
    }
}

async fn dir_is_empty(dir: &Path) -> io::Result<bool> {
    let mut entries = fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
