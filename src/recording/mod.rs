//! Recording sink
//!
//! Captured audio is appended to a raw PCM file per guild. On stop the file
//! is closed and, unless discarded, converted by a [`Transcoder`] into the
//! sounds directory. Raw files never outlive their job.

mod file_sink;
mod naming;
mod recorder;
mod transcoder;

pub use file_sink::FileSink;
pub use naming::{sanitize_name, sound_name};
pub use recorder::{Recorder, RecordingJob, RecordingStatus};
pub use transcoder::{FfmpegTranscoder, Transcoder};
