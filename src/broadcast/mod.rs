//! Live broadcast sink
//!
//! Fans the merged capture out to remote listeners in real time. Delivery is
//! best effort: a listener that falls behind misses chunks, a listener that
//! went away is dropped. An emptied broadcast is released only after a grace
//! window during which nobody rejoined.

mod broadcaster;
mod listener;
mod session;

pub use broadcaster::{LiveBroadcaster, LiveStatus};
pub use listener::{ListenerSink, ListenerStream};
pub use session::{BroadcastSession, ListenerId};
