use uuid::Uuid;

use crate::voice::{ConnectionId, GuildId};

/// Asynchronous notifications delivered to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A voice connection is gone for good. `connection` tells a stale
    /// report apart from one about the guild's current connection.
    ConnectionLost {
        guild: GuildId,
        connection: ConnectionId,
    },

    /// A broadcast stayed without listeners for its whole grace window
    BroadcastIdle { guild: GuildId, session: Uuid },
}
