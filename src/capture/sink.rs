use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// Which consumer a sink feeds. A multiplexer holds at most one sink per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Recording,
    Broadcast,
}

/// Consumer of forwarded audio bytes
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Accept one chunk. May wait on the sink's own backpressure.
    async fn write(&self, chunk: Bytes) -> Result<()>;

    /// Stop accepting chunks and release the underlying resource
    async fn close(&self) -> Result<()>;
}
