//! The session registry: single source of truth for who is connected.
//!
//! # Concurrency note
//!
//! `SessionRegistry` is NOT thread-safe by itself — it uses a plain
//! `HashMap`, not a concurrent one. This is intentional: the registry is
//! owned by the presence engine, which is accessed through one lock at a
//! higher level. Only the handler processing a message for a given
//! connection mutates that connection's entry; the one cross-connection
//! mutation (takeover eviction) runs inside the same locked engine call,
//! so it is sequential, never concurrent.

use std::collections::HashMap;

use overmap_transport::ConnectionId;

use crate::PlayerSession;

/// Maps each live connection to its [`PlayerSession`] record.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, PlayerSession>,
}

impl SessionRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Registers a session for a connection, replacing any previous one.
    pub fn register(&mut self, conn: ConnectionId, session: PlayerSession) {
        self.sessions.insert(conn, session);
    }

    /// Looks up the session for a connection.
    pub fn get(&self, conn: ConnectionId) -> Option<&PlayerSession> {
        self.sessions.get(&conn)
    }

    /// Mutable lookup. Only the handler driving `conn`'s messages may
    /// use this.
    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut PlayerSession> {
        self.sessions.get_mut(&conn)
    }

    /// Removes and returns the session for a connection. Removing an
    /// absent connection is a no-op, which is what makes repeated
    /// takeover evictions harmless.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<PlayerSession> {
        self.sessions.remove(&conn)
    }

    /// Iterates over all sessions. Iteration order is irrelevant.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &PlayerSession)> {
        self.sessions.iter().map(|(conn, s)| (*conn, s))
    }

    /// All live connections, spectators included.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    /// The global online count: non-spectator sessions only.
    pub fn online_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_spectator).count()
    }

    /// Connections other than `exclude` holding the exact same
    /// (`user_id`, `session_id`) identity — duplicate client instances.
    /// More than one can exist, so this returns all of them.
    pub fn find_duplicates(
        &self,
        user_id: &str,
        session_id: &str,
        exclude: ConnectionId,
    ) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|(conn, s)| {
                **conn != exclude
                    && !s.is_spectator
                    && s.user_id.as_deref() == Some(user_id)
                    && s.session_id == session_id
            })
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// The live connection holding a (`user_id`, `session_id`) identity,
    /// if any. Used to locate the victim of a session replacement.
    pub fn find_by_identity(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Option<ConnectionId> {
        self.sessions
            .iter()
            .find(|(_, s)| {
                !s.is_spectator
                    && s.user_id.as_deref() == Some(user_id)
                    && s.session_id == session_id
            })
            .map(|(conn, _)| *conn)
    }

    /// Returns the number of registered connections (any kind).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use overmap_protocol::MapId;
    use serde_json::json;

    use super::*;
    use crate::PlayerSession;

    fn conn(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn session(user: Option<&str>, sid: &str, spectator: bool) -> PlayerSession {
        let now = Instant::now();
        PlayerSession {
            user_id: user.map(str::to_string),
            session_id: sid.to_string(),
            username: "Ada".into(),
            sprite: "mage".into(),
            map_id: MapId::from("town"),
            position: json!({ "x": 0, "y": 0 }),
            is_spectator: spectator,
            last_update: now,
            last_position_update: None,
            last_seen_refresh: now,
        }
    }

    #[test]
    fn test_register_then_get_returns_session() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s1", false));

        let s = reg.get(conn(1)).expect("session should exist");
        assert_eq!(s.session_id, "s1");
    }

    #[test]
    fn test_remove_absent_connection_is_noop() {
        let mut reg = SessionRegistry::new();
        assert!(reg.remove(conn(9)).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_online_count_excludes_spectators() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s1", false));
        reg.register(conn(2), session(Some("u2"), "s2", false));
        reg.register(conn(3), session(Some("u3"), "s3", true));

        assert_eq!(reg.online_count(), 2);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_find_duplicates_matches_same_user_and_session() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s1", false));
        reg.register(conn(2), session(Some("u1"), "s1", false));
        reg.register(conn(3), session(Some("u1"), "s2", false));

        let dups = reg.find_duplicates("u1", "s1", conn(4));
        assert_eq!(dups.len(), 2);
        assert!(dups.contains(&conn(1)));
        assert!(dups.contains(&conn(2)));
    }

    #[test]
    fn test_find_duplicates_excludes_the_joining_connection() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s1", false));

        let dups = reg.find_duplicates("u1", "s1", conn(1));
        assert!(dups.is_empty());
    }

    #[test]
    fn test_find_duplicates_ignores_spectators() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s1", true));

        assert!(reg.find_duplicates("u1", "s1", conn(2)).is_empty());
    }

    #[test]
    fn test_find_by_identity_locates_stale_session() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(Some("u1"), "s-old", false));
        reg.register(conn(2), session(Some("u2"), "s2", false));

        assert_eq!(reg.find_by_identity("u1", "s-old"), Some(conn(1)));
        assert_eq!(reg.find_by_identity("u1", "s-new"), None);
    }

    #[test]
    fn test_anonymous_sessions_never_match_identity_scans() {
        let mut reg = SessionRegistry::new();
        reg.register(conn(1), session(None, "s1", false));

        assert!(reg.find_duplicates("u1", "s1", conn(2)).is_empty());
        assert_eq!(reg.find_by_identity("u1", "s1"), None);
    }
}
