//! Message contract for the real-time preference channel.
//!
//! Only the message shapes matter to the engine; the duplex transport
//! (websocket, socket bridge, in-process bus) is an external collaborator
//! behind the [`ChannelTransport`] trait.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{SessionId, SyncResult, UserId};

/// Messages the engine emits onto the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelOutbound {
    /// Join the per-user broadcast room
    Join {
        user_id: UserId,
        session_id: SessionId,
    },

    /// Optimistic push of the full document to other sessions, ahead of
    /// persistence confirmation
    BroadcastPreferences {
        user_id: UserId,
        preferences: Map<String, Value>,
        /// Optimistic version: current confirmed version + 1
        version: u64,
        origin_session_id: SessionId,
    },

    /// Periodic liveness signal keeping the room membership alive; no
    /// response is expected
    Heartbeat { timestamp: i64 },
}

/// Messages the engine consumes from the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelInbound {
    /// Acknowledgment of a room join
    Joined { room: String, session_count: u32 },

    /// Another session joined or left the room
    SessionCountUpdated { session_count: u32 },

    /// A (possibly optimistic) document update from another session or a
    /// server-side save confirmation
    PreferencesUpdated {
        preferences: Map<String, Value>,
        version: u64,
        origin_session_id: Option<SessionId>,
    },
}

/// Duplex pub/sub transport as seen by the engine.
///
/// Implementations relay [`ChannelOutbound`] messages to the server and feed
/// [`ChannelInbound`] messages back through the coordinator's run loop.
pub trait ChannelTransport: Send + Sync {
    /// Whether the transport currently has a live connection
    fn is_connected(&self) -> bool;

    /// Emit a message onto the channel
    fn send(&self, msg: ChannelOutbound) -> SyncResult<()>;
}
