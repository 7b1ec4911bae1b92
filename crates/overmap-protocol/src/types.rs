//! Core wire types for the Overmap presence protocol.
//!
//! Every frame that travels on the WebSocket channel is defined here.
//! The wire format is JSON text, internally tagged with a `type` field,
//! matching what the overworld client already speaks: `{"type":"join",
//! "userId":...,"sessionId":...}` inbound, `{"type":"playersList",...}`
//! outbound.

use serde::{Deserialize, Serialize};

use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies a map (one named area of the overworld).
///
/// Newtype over the client-supplied map name so a map id can't be
/// confused with a user or session id in signatures. Serializes as the
/// plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(pub String);

impl MapId {
    /// Returns the map name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The map a player lands on when the join frame names none.
pub const DEFAULT_MAP: &str = "overworld";

impl Default for MapId {
    fn default() -> Self {
        Self(DEFAULT_MAP.to_string())
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MapId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A player's position payload.
///
/// The server never interprets coordinates — it stores the last accepted
/// payload and relays it verbatim, so clients are free to evolve the
/// shape (facing, animation state, velocity) without a server change.
pub type Position = serde_json::Value;

/// The canonical position a player materializes at after a map transfer:
/// the target coordinates, facing down, idle.
pub fn spawn_position(x: f64, y: f64) -> Position {
    serde_json::json!({
        "x": x,
        "y": y,
        "direction": "down",
        "isMoving": false,
    })
}

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

/// Machine-distinguishable reasons the server closes a transport.
///
/// Carried in the WebSocket close frame (application close-code range)
/// so a displaced client can tell "logged in elsewhere" apart from an
/// ordinary network drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A second connection showed up with the same user *and* session id
    /// (duplicate client instance, e.g. the same tab opened twice).
    DuplicateConnection,

    /// A newer connection claimed the same user id with a different
    /// session id; the newest login always wins.
    SessionReplaced,

    /// The session went silent past the configured idle timeout and was
    /// reaped by the liveness sweep.
    IdleTimeout,
}

impl CloseReason {
    /// The WebSocket close code for this reason (4000-range, app-defined).
    pub fn code(self) -> u16 {
        match self {
            Self::DuplicateConnection => 4001,
            Self::SessionReplaced => 4002,
            Self::IdleTimeout => 4003,
        }
    }

    /// The close-frame reason string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateConnection => "duplicate-connection",
            Self::SessionReplaced => "session-replaced",
            Self::IdleTimeout => "idle-timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlayerInfo — occupant snapshot entry
// ---------------------------------------------------------------------------

/// One entry of an occupant snapshot (`playersList`) or a `playerJoined`
/// announcement. Display metadata is resolved once at join time and
/// carried here unchanged for the life of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    /// Stable identity, absent for anonymous connections.
    pub user_id: Option<String>,
    /// Client-chosen session discriminator (tab refresh, reconnect).
    pub session_id: String,
    pub username: String,
    pub sprite: String,
    pub map_id: MapId,
    pub position: Position,
}

// ---------------------------------------------------------------------------
// ClientFrame — inbound messages
// ---------------------------------------------------------------------------

/// Frames a client may send. The `type` tag is the discriminator; any
/// other tag fails to decode and earns the catch-all `error` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Announce presence on a map. First meaningful frame of a session.
    Join {
        #[serde(default)]
        user_id: Option<String>,
        session_id: String,
        position: Position,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        sprite: Option<String>,
        #[serde(default)]
        map_id: Option<MapId>,
        #[serde(default)]
        is_spectator: bool,
        /// Free-form device description stored with the active-session
        /// record (shown in "logged in elsewhere" UIs).
        #[serde(default)]
        device: Option<String>,
    },

    /// Report a new position. Dominates traffic volume; rate limited.
    UpdatePosition { position: Position },

    /// Move to another map at the given spawn coordinates.
    ChangeMap {
        target_map_id: MapId,
        target_x: f64,
        target_y: f64,
    },

    /// Explicitly leave the overworld (same teardown as a dropped
    /// transport).
    Leave,

    /// Ask the server to persist a position without any broadcast.
    SaveLocation {
        position: Position,
        #[serde(default)]
        map_id: Option<MapId>,
    },

    /// Liveness ping; refreshes the active-session record.
    Heartbeat,
}

// ---------------------------------------------------------------------------
// ServerFrame — outbound messages
// ---------------------------------------------------------------------------

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Occupant snapshot of the requester's map, excluding the requester.
    /// Sent in reply to `join` and `changeMap`.
    PlayersList { players: Vec<PlayerInfo> },

    /// A new occupant appeared on the recipient's map.
    PlayerJoined { player: PlayerInfo },

    /// An occupant of the recipient's map moved. `timestamp` is server
    /// milliseconds, for client-side interpolation.
    PlayerMoved {
        user_id: Option<String>,
        session_id: String,
        position: Position,
        timestamp: u64,
    },

    /// An occupant left the recipient's map (or the overworld).
    PlayerLeft {
        user_id: Option<String>,
        session_id: String,
    },

    /// Global non-spectator connection count. Goes to every connection,
    /// spectators included.
    OnlineCount { count: usize },

    /// Notice sent to a connection about to be evicted because a newer
    /// login claimed its identity.
    SessionKicked { message: String },

    /// Catch-all reply to a frame the server could not understand.
    Error { message: String },
}

// =========================================================================
// Tests
// =========================================================================
