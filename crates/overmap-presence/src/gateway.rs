//! The persistence gateway: the narrow seam to the external store.
//!
//! Overmap doesn't ship a database driver — deployments implement
//! [`PersistenceGateway`] against whatever holds user profiles,
//! last-known positions, and active-session records. Everything behind
//! this trait is eventually consistent by design: the engine's writes
//! are spawned fire-and-forget after in-memory state is already
//! consistent, and a failed write is logged, never retried, and never
//! rolled back into the protocol.
//!
//! Two implementations live here: [`NullGateway`] (persist nothing,
//! useful in development) and [`MemoryGateway`] (an in-process store for
//! tests and the demo server).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use overmap_protocol::{MapId, Position};

/// The store's record of a user's one allowed live session, keyed
/// uniquely by user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: String,
    pub device_info: Option<String>,
    pub connected_at: SystemTime,
}

/// Errors surfaced by a gateway implementation.
///
/// No gateway error is ever fatal to the realtime protocol: writes are
/// logged and swallowed, and the one read on the join path (the
/// active-session lookup) degrades to "no prior session found".
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

/// The persistence operations the presence engine consumes.
///
/// Methods return explicitly `Send` futures because the server spawns
/// the write-side calls onto the runtime as fire-and-forget tasks.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Upserts the user's last-known position, keyed by user id.
    fn upsert_last_position(
        &self,
        user_id: &str,
        map_id: &MapId,
        position: &Position,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Reads the user's recorded active session, if any.
    fn get_active_session(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<ActiveSession>, GatewayError>> + Send;

    /// Upserts the active-session record for a user.
    fn upsert_active_session(
        &self,
        user_id: &str,
        session_id: &str,
        device_info: Option<&str>,
        connected_at: SystemTime,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Deletes the active-session record, but only if it still names
    /// the given session id (a newer login's record must survive).
    fn delete_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Refreshes the liveness timestamp on an active-session record.
    fn touch_heartbeat(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Refreshes the user's last-seen timestamp.
    fn touch_last_seen(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Resolves a user's display name. `Ok(None)` means the user has no
    /// profile; the join falls back to the client-supplied name.
    fn lookup_profile(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<String>, GatewayError>> + Send;
}

/// Delegating impl so a shared handle to a store can be handed to the
/// server while the caller keeps one for inspection.
impl<G: PersistenceGateway> PersistenceGateway for Arc<G> {
    async fn upsert_last_position(
        &self,
        user_id: &str,
        map_id: &MapId,
        position: &Position,
    ) -> Result<(), GatewayError> {
        self.as_ref()
            .upsert_last_position(user_id, map_id, position)
            .await
    }

    async fn get_active_session(
        &self,
        user_id: &str,
    ) -> Result<Option<ActiveSession>, GatewayError> {
        self.as_ref().get_active_session(user_id).await
    }

    async fn upsert_active_session(
        &self,
        user_id: &str,
        session_id: &str,
        device_info: Option<&str>,
        connected_at: SystemTime,
    ) -> Result<(), GatewayError> {
        self.as_ref()
            .upsert_active_session(user_id, session_id, device_info, connected_at)
            .await
    }

    async fn delete_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), GatewayError> {
        self.as_ref().delete_active_session(user_id, session_id).await
    }

    async fn touch_heartbeat(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), GatewayError> {
        self.as_ref().touch_heartbeat(user_id, session_id).await
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), GatewayError> {
        self.as_ref().touch_last_seen(user_id).await
    }

    async fn lookup_profile(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        self.as_ref().lookup_profile(user_id).await
    }
}

// ---------------------------------------------------------------------------
// ProfileCache
// ---------------------------------------------------------------------------

/// Process-lifetime cache of resolved display names. A profile is looked
/// up at most once per user per server process; joins after the first
/// hit the cache.
#[derive(Debug, Default)]
pub struct ProfileCache {
    names: HashMap<String, String>,
}

impl ProfileCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached display name for a user, if resolved before.
    pub fn get(&self, user_id: &str) -> Option<&str> {
        self.names.get(user_id).map(String::as_str)
    }

    /// Caches a resolved display name.
    pub fn insert(&mut self, user_id: &str, username: &str) {
        self.names.insert(user_id.to_string(), username.to_string());
    }
}

// ---------------------------------------------------------------------------
// NullGateway
// ---------------------------------------------------------------------------

/// A gateway that persists nothing and knows nobody. Joins resolve to
/// client-supplied names, takeover sees no prior sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGateway;

impl PersistenceGateway for NullGateway {
    async fn upsert_last_position(
        &self,
        _user_id: &str,
        _map_id: &MapId,
        _position: &Position,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn get_active_session(
        &self,
        _user_id: &str,
    ) -> Result<Option<ActiveSession>, GatewayError> {
        Ok(None)
    }

    async fn upsert_active_session(
        &self,
        _user_id: &str,
        _session_id: &str,
        _device_info: Option<&str>,
        _connected_at: SystemTime,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn delete_active_session(
        &self,
        _user_id: &str,
        _session_id: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        _user_id: &str,
        _session_id: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn touch_last_seen(&self, _user_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn lookup_profile(
        &self,
        _user_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// MemoryGateway
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryStore {
    last_positions: HashMap<String, (MapId, Position)>,
    active_sessions: HashMap<String, ActiveSession>,
    profiles: HashMap<String, String>,
    heartbeats: HashMap<String, SystemTime>,
    last_seen: HashMap<String, SystemTime>,
}

/// An in-process store. Backs the integration tests and the demo
/// server; a real deployment implements the trait against its database.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    store: Mutex<MemoryStore>,
}

impl MemoryGateway {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user profile; builder-style for test setup.
    pub fn with_profile(self, user_id: &str, username: &str) -> Self {
        self.store
            .lock()
            .expect("store lock")
            .profiles
            .insert(user_id.to_string(), username.to_string());
        self
    }

    /// The recorded active session for a user, if any.
    pub fn active_session_of(&self, user_id: &str) -> Option<ActiveSession> {
        self.store
            .lock()
            .expect("store lock")
            .active_sessions
            .get(user_id)
            .cloned()
    }

    /// The recorded last position for a user, if any.
    pub fn last_position_of(&self, user_id: &str) -> Option<(MapId, Position)> {
        self.store
            .lock()
            .expect("store lock")
            .last_positions
            .get(user_id)
            .cloned()
    }
}

impl PersistenceGateway for MemoryGateway {
    async fn upsert_last_position(
        &self,
        user_id: &str,
        map_id: &MapId,
        position: &Position,
    ) -> Result<(), GatewayError> {
        self.store
            .lock()
            .expect("store lock")
            .last_positions
            .insert(user_id.to_string(), (map_id.clone(), position.clone()));
        Ok(())
    }

    async fn get_active_session(
        &self,
        user_id: &str,
    ) -> Result<Option<ActiveSession>, GatewayError> {
        Ok(self
            .store
            .lock()
            .expect("store lock")
            .active_sessions
            .get(user_id)
            .cloned())
    }

    async fn upsert_active_session(
        &self,
        user_id: &str,
        session_id: &str,
        device_info: Option<&str>,
        connected_at: SystemTime,
    ) -> Result<(), GatewayError> {
        self.store.lock().expect("store lock").active_sessions.insert(
            user_id.to_string(),
            ActiveSession {
                session_id: session_id.to_string(),
                device_info: device_info.map(str::to_string),
                connected_at,
            },
        );
        Ok(())
    }

    async fn delete_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), GatewayError> {
        let mut store = self.store.lock().expect("store lock");
        // Only delete the record the caller thinks it owns; a newer
        // login may already have replaced it.
        if store
            .active_sessions
            .get(user_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            store.active_sessions.remove(user_id);
        }
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        user_id: &str,
        _session_id: &str,
    ) -> Result<(), GatewayError> {
        self.store
            .lock()
            .expect("store lock")
            .heartbeats
            .insert(user_id.to_string(), SystemTime::now());
        Ok(())
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), GatewayError> {
        self.store
            .lock()
            .expect("store lock")
            .last_seen
            .insert(user_id.to_string(), SystemTime::now());
        Ok(())
    }

    async fn lookup_profile(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        Ok(self
            .store
            .lock()
            .expect("store lock")
            .profiles
            .get(user_id)
            .cloned())
    }
}

// =========================================================================
// Tests
// =========================================================================
