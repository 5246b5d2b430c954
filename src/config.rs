use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub voice: VoiceConfig,
    pub recording: RecordingConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-relay".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Voice connection timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// How long a capture session waits for the connection to become ready
    pub join_timeout_secs: u64,

    /// Shorter wait used by playback-only joins
    pub playback_join_timeout_secs: u64,

    /// How long a disconnected connection gets to start reconnecting
    pub reconnect_window_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 10,
            playback_join_timeout_secs: 5,
            reconnect_window_secs: 5,
        }
    }
}

impl VoiceConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn playback_join_timeout(&self) -> Duration {
        Duration::from_secs(self.playback_join_timeout_secs)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory the finished recordings are written to
    pub sounds_path: PathBuf,

    /// Root for per-guild raw capture directories
    pub temp_path: PathBuf,

    /// Raw captures smaller than this are rejected before transcoding
    pub min_capture_bytes: u64,

    /// Bounded wait for the raw file writer to acknowledge close
    pub close_timeout_ms: u64,

    /// Bounded wait for the transcoder process
    pub transcode_timeout_secs: u64,

    pub ffmpeg_path: PathBuf,
    pub bitrate: String,
    pub output_channels: u16,
    pub extension: String,
    pub max_name_len: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sounds_path: PathBuf::from("sounds"),
            temp_path: PathBuf::from("sounds/.capture"),
            min_capture_bytes: 100,
            close_timeout_ms: 1000,
            transcode_timeout_secs: 120,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            bitrate: "128k".to_string(),
            output_channels: 2,
            extension: "mp3".to_string(),
            max_name_len: 32,
        }
    }
}

impl RecordingConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Grace window before an empty broadcast releases the voice connection
    pub grace_secs: u64,

    /// Chunks buffered per listener before it starts missing data
    pub listener_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            grace_secs: 5,
            listener_buffer: 64,
        }
    }
}

impl BroadcastConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("VOICE_RELAY").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
