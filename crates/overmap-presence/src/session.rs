//! Session types: the server's record of one connected player.

use std::time::{Duration, Instant};

use overmap_protocol::{MapId, PlayerInfo, Position};

// ---------------------------------------------------------------------------
// PresenceConfig
// ---------------------------------------------------------------------------

/// Tunables for the presence engine.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum interval between accepted position updates per
    /// connection. Updates arriving faster are dropped silently.
    ///
    /// Default: 66 ms (~15 accepted updates per second).
    pub update_interval: Duration,

    /// Map assigned when a join frame names none.
    pub default_map: MapId,

    /// Evict sessions with no inbound activity for this long. `None`
    /// (the default) disables the liveness sweep and relies on the
    /// transport's close detection alone.
    pub idle_timeout: Option<Duration>,

    /// How often an active stream of position updates refreshes the
    /// user's last-seen record in the store.
    pub last_seen_refresh: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(66),
            default_map: MapId::default(),
            idle_timeout: None,
            last_seen_refresh: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// PlayerSession
// ---------------------------------------------------------------------------

/// One logical player, keyed by its connection in the registry.
///
/// Created on `join`, mutated only by frames from its own connection
/// (takeover eviction removes it wholesale, never edits it), destroyed
/// on `leave`, transport close, or eviction.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    /// Stable identity. Absent for anonymous connections; spectators
    /// may carry one for display purposes but are never persisted.
    pub user_id: Option<String>,

    /// Client-chosen discriminator between connections of the same
    /// user (tab refresh, reconnect, second device).
    pub session_id: String,

    /// Display name, resolved once at join time and cached for the life
    /// of the connection.
    pub username: String,

    /// Sprite key, supplied by the client at join time.
    pub sprite: String,

    /// The map this player currently occupies.
    pub map_id: MapId,

    /// Last accepted position payload, relayed verbatim.
    pub position: Position,

    /// Spectators observe a map but are excluded from occupant lists,
    /// broadcasts about themselves, counts, and persistence.
    pub is_spectator: bool,

    /// Last inbound activity of any kind; drives the liveness sweep.
    pub last_update: Instant,

    /// When the last position update was *accepted* (not merely
    /// submitted); drives the rate limiter.
    pub last_position_update: Option<Instant>,

    /// When the user's last-seen record was last refreshed.
    pub last_seen_refresh: Instant,
}

impl PlayerSession {
    /// The occupant-snapshot entry for this session.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            sprite: self.sprite.clone(),
            map_id: self.map_id.clone(),
            position: self.position.clone(),
        }
    }
}
