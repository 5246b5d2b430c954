//! Voice session orchestration
//!
//! This module provides the `SessionOrchestrator`, the per-guild state machine
//! behind the control surface:
//! - Joining or reusing the guild's voice connection
//! - Starting and stopping recordings (with transcoding on stop)
//! - Starting and stopping live broadcasts and connecting listeners
//! - Unified cleanup when the connection is lost

mod event;
mod orchestrator;
mod stats;

pub use event::SessionEvent;
pub use orchestrator::SessionOrchestrator;
pub use stats::{SavedRecording, SessionPhase, VoiceSessionInfo};
