//! Speaker capture
//!
//! Fans the raw audio of every active speaker out to the registered sinks.

mod multiplexer;
mod sink;

pub use multiplexer::SpeakerMultiplexer;
pub use sink::{Sink, SinkKind};

/// Raw capture format emitted by the platform: signed 16-bit little-endian PCM
pub const PCM_FORMAT: &str = "s16le";
pub const PCM_SAMPLE_RATE: u32 = 48_000;
pub const PCM_CHANNELS: u16 = 2;
