use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::capture::{PCM_CHANNELS, PCM_FORMAT, PCM_SAMPLE_RATE};
use crate::config::RecordingConfig;
use crate::error::{Result, VoiceError};

/// Converts a finished raw PCM capture into the distributable format
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, raw: &Path, output: &Path) -> Result<()>;
}

/// One-shot ffmpeg invocation per recording
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    bitrate: String,
    output_channels: u16,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            bitrate: config.bitrate.clone(),
            output_channels: config.output_channels,
            timeout: config.transcode_timeout(),
        }
    }

    fn args(&self, raw: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            PCM_FORMAT,
        ]
        .iter()
        .map(OsString::from)
        .collect();

        args.push("-ar".into());
        args.push(PCM_SAMPLE_RATE.to_string().into());
        args.push("-ac".into());
        args.push(PCM_CHANNELS.to_string().into());
        args.push("-i".into());
        args.push(raw.as_os_str().to_owned());
        args.push("-ac".into());
        args.push(self.output_channels.to_string().into());
        args.push("-b:a".into());
        args.push(self.bitrate.clone().into());
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, raw: &Path, output: &Path) -> Result<()> {
        debug!(
            "Transcoding {} -> {} with {}",
            raw.display(),
            output.display(),
            self.program.display()
        );

        let child = Command::new(&self.program)
            .args(self.args(raw, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoiceError::TranscodeFailure(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let out = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::TranscodeFailure(format!(
                    "{} did not finish within {:?}",
                    self.program.display(),
                    self.timeout
                ))
            })??;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                out.status.to_string()
            } else {
                format!("{}: {}", out.status, stderr)
            };
            return Err(VoiceError::TranscodeFailure(detail));
        }

        info!("Transcoded recording to {}", output.display());
        Ok(())
    }
}
