//! The presence engine: the message-driven state machine every
//! connection moves through (`unjoined → active(map) → … → terminated`),
//! including session takeover, map transfer, and rate-limited movement
//! fan-out.
//!
//! # Mutation/IO split
//!
//! The engine owns the session registry and the map index and is the
//! only thing allowed to mutate them. Every operation is a plain
//! synchronous method: it brings the in-memory state to its final shape
//! and returns a list of [`Effect`]s — frames to send, transports to
//! close, store writes to spawn — for the caller to execute afterwards.
//! Because no operation ever awaits, a concurrently scheduled handler
//! for another connection can never observe a half-applied transition;
//! the caller serializes operations behind one lock and does all IO
//! outside the engine.
//!
//! The one read a join needs from the store (the prior active-session
//! record) happens *before* the engine is entered and is passed in; a
//! failed read degrades to "no prior session found" rather than
//! blocking the join.

use std::time::{Instant, SystemTime};

use overmap_protocol::{
    CloseReason, MapId, PlayerInfo, Position, ServerFrame, spawn_position,
};
use overmap_transport::ConnectionId;

use crate::{
    ActiveSession, MapIndex, PlayerSession, PresenceConfig, SessionRegistry,
    UpdateLimiter,
};

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// A store write the engine wants performed. Executed fire-and-forget
/// after the in-memory transition is already complete; a failure is
/// logged and never surfaces to the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    UpsertLastPosition {
        user_id: String,
        map_id: MapId,
        position: Position,
    },
    UpsertActiveSession {
        user_id: String,
        session_id: String,
        device_info: Option<String>,
        connected_at: SystemTime,
    },
    DeleteActiveSession {
        user_id: String,
        session_id: String,
    },
    TouchHeartbeat {
        user_id: String,
        session_id: String,
    },
    TouchLastSeen {
        user_id: String,
    },
}

/// One IO action produced by an engine operation. Executed in order by
/// the caller; frame sends to a single connection are delivered in the
/// order they appear.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver a frame to one connection.
    Send {
        to: ConnectionId,
        frame: ServerFrame,
    },
    /// Close a transport with a machine-distinguishable reason, after
    /// any frames queued above it.
    Close {
        conn: ConnectionId,
        reason: CloseReason,
    },
    /// Spawn a best-effort store write.
    Persist(PersistOp),
}

// ---------------------------------------------------------------------------
// JoinRequest
// ---------------------------------------------------------------------------

/// A validated join, with display metadata already resolved by the
/// caller (profile cache, then gateway lookup, then the client-supplied
/// fallback — never blocking the join).
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: Option<String>,
    pub session_id: String,
    pub username: String,
    pub sprite: String,
    pub map_id: MapId,
    pub position: Position,
    pub is_spectator: bool,
    pub device: Option<String>,
}

// ---------------------------------------------------------------------------
// PresenceEngine
// ---------------------------------------------------------------------------

/// Owns all live presence state for one server process.
///
/// Rebuilt empty on restart; the store behind the persistence gateway
/// is the only durable record.
pub struct PresenceEngine {
    config: PresenceConfig,
    registry: SessionRegistry,
    index: MapIndex,
    limiter: UpdateLimiter,
    /// Server time origin for `playerMoved` timestamps.
    epoch: Instant,
}

impl PresenceEngine {
    /// Creates an empty engine with the given config.
    pub fn new(config: PresenceConfig) -> Self {
        let limiter = UpdateLimiter::new(config.update_interval);
        Self {
            config,
            registry: SessionRegistry::new(),
            index: MapIndex::new(),
            limiter,
            epoch: Instant::now(),
        }
    }

    /// The engine's config.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Global non-spectator count.
    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    /// The session for a connection, if joined.
    pub fn session(&self, conn: ConnectionId) -> Option<&PlayerSession> {
        self.registry.get(conn)
    }

    /// Occupants of a map (never spectators).
    pub fn occupants_of(&self, map: &MapId) -> Vec<ConnectionId> {
        self.index.occupants_of(map).collect()
    }

    // -----------------------------------------------------------------
    // join
    // -----------------------------------------------------------------

    /// Handles a `join` frame: session takeover for non-spectators, then
    /// registration, indexing, the occupant-snapshot reply, and the
    /// `playerJoined` / `onlineCount` fan-out.
    ///
    /// `prior` is the store's active-session record for this user, read
    /// by the caller before entering the engine (`None` on read failure).
    pub fn join(
        &mut self,
        conn: ConnectionId,
        req: JoinRequest,
        prior: Option<ActiveSession>,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        // A repeated join on the same connection replaces its previous
        // session without ceremony.
        if let Some(old) = self.registry.remove(conn) {
            if old.is_spectator {
                self.index.remove_watcher(conn, &old.map_id);
            } else {
                self.index.remove_occupant(conn, &old.map_id);
            }
        }

        if !req.is_spectator {
            if let Some(user_id) = req.user_id.clone() {
                self.run_takeover(
                    conn,
                    &user_id,
                    &req.session_id,
                    req.device.as_deref(),
                    prior,
                    &mut effects,
                );
            }
        }

        // Snapshot the target map before the newcomer is indexed, so
        // the reply never contains the joiner itself.
        let players: Vec<PlayerInfo> = self
            .index
            .occupants_of(&req.map_id)
            .filter_map(|c| self.registry.get(c).map(PlayerSession::info))
            .collect();

        let session = PlayerSession {
            user_id: req.user_id.clone(),
            session_id: req.session_id.clone(),
            username: req.username,
            sprite: req.sprite,
            map_id: req.map_id.clone(),
            position: req.position,
            is_spectator: req.is_spectator,
            last_update: now,
            last_position_update: None,
            last_seen_refresh: now,
        };
        let info = session.info();

        tracing::info!(
            %conn,
            user_id = req.user_id.as_deref().unwrap_or("-"),
            session_id = %req.session_id,
            map = %req.map_id,
            spectator = req.is_spectator,
            "player joined"
        );

        self.registry.register(conn, session);
        if req.is_spectator {
            self.index.add_watcher(conn, &req.map_id);
        } else {
            self.index.add_occupant(conn, &req.map_id);
        }

        effects.push(Effect::Send {
            to: conn,
            frame: ServerFrame::PlayersList { players },
        });

        if !req.is_spectator {
            for to in self.index.audience_of(&req.map_id, Some(conn)) {
                effects.push(Effect::Send {
                    to,
                    frame: ServerFrame::PlayerJoined {
                        player: info.clone(),
                    },
                });
            }
            if let Some(user_id) = req.user_id {
                effects.push(Effect::Persist(PersistOp::TouchLastSeen {
                    user_id,
                }));
            }
            self.push_online_count(&mut effects);
        }

        effects
    }

    /// The session-takeover sub-protocol: at most one live connection per
    /// user identity, newest join wins.
    fn run_takeover(
        &mut self,
        conn: ConnectionId,
        user_id: &str,
        session_id: &str,
        device: Option<&str>,
        prior: Option<ActiveSession>,
        effects: &mut Vec<Effect>,
    ) {
        // Step 1: duplicate client instances — same user AND same
        // session id. All of them, not just the first.
        for dup in self.registry.find_duplicates(user_id, session_id, conn) {
            tracing::info!(%dup, user_id, "evicting duplicate client instance");
            self.evict(dup, CloseReason::DuplicateConnection, None, effects);
        }

        // Step 2: the store says some *other* session is active for this
        // user. Notify and evict its live connection if it's ours, then
        // clear the stale record either way.
        if let Some(prior) = prior {
            if prior.session_id != session_id {
                if let Some(stale) =
                    self.registry.find_by_identity(user_id, &prior.session_id)
                {
                    tracing::info!(%stale, user_id, "replacing stale session");
                    self.evict(
                        stale,
                        CloseReason::SessionReplaced,
                        Some("signed in from another session".to_string()),
                        effects,
                    );
                }
                effects.push(Effect::Persist(PersistOp::DeleteActiveSession {
                    user_id: user_id.to_string(),
                    session_id: prior.session_id,
                }));
            }
        }

        // Step 3: claim the identity for the new session.
        effects.push(Effect::Persist(PersistOp::UpsertActiveSession {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            device_info: device.map(str::to_string),
            connected_at: SystemTime::now(),
        }));
    }

    /// Removes a connection's presence and closes its transport.
    /// Evicting an already-absent connection is a no-op, which keeps
    /// takeover correct under any interleaving of competing joins.
    fn evict(
        &mut self,
        conn: ConnectionId,
        reason: CloseReason,
        notice: Option<String>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(session) = self.registry.remove(conn) else {
            return;
        };

        if session.is_spectator {
            self.index.remove_watcher(conn, &session.map_id);
        } else {
            self.index.remove_occupant(conn, &session.map_id);
            for to in self.index.audience_of(&session.map_id, None) {
                effects.push(Effect::Send {
                    to,
                    frame: ServerFrame::PlayerLeft {
                        user_id: session.user_id.clone(),
                        session_id: session.session_id.clone(),
                    },
                });
            }
        }

        if let Some(message) = notice {
            effects.push(Effect::Send {
                to: conn,
                frame: ServerFrame::SessionKicked { message },
            });
        }
        effects.push(Effect::Close { conn, reason });
    }

    // -----------------------------------------------------------------
    // updatePosition
    // -----------------------------------------------------------------

    /// Handles an `updatePosition` frame. A no-op for spectators and
    /// unjoined connections; dropped silently when it arrives inside the
    /// rate-limit interval. The stored position always reflects the most
    /// recently *accepted* update.
    pub fn update_position(
        &mut self,
        conn: ConnectionId,
        position: Position,
        now: Instant,
    ) -> Vec<Effect> {
        let (map_id, user_id, session_id, refresh_last_seen);
        {
            let Some(session) = self.registry.get_mut(conn) else {
                return Vec::new();
            };
            if session.is_spectator {
                return Vec::new();
            }
            if !self.limiter.accepts(session.last_position_update, now) {
                return Vec::new();
            }

            session.position = position.clone();
            session.last_update = now;
            session.last_position_update = Some(now);

            refresh_last_seen = session.user_id.is_some()
                && now.saturating_duration_since(session.last_seen_refresh)
                    >= self.config.last_seen_refresh;
            if refresh_last_seen {
                session.last_seen_refresh = now;
            }

            map_id = session.map_id.clone();
            user_id = session.user_id.clone();
            session_id = session.session_id.clone();
        }

        let timestamp = self.timestamp_ms(now);
        let mut effects = Vec::new();
        for to in self.index.audience_of(&map_id, Some(conn)) {
            effects.push(Effect::Send {
                to,
                frame: ServerFrame::PlayerMoved {
                    user_id: user_id.clone(),
                    session_id: session_id.clone(),
                    position: position.clone(),
                    timestamp,
                },
            });
        }
        if refresh_last_seen {
            if let Some(user_id) = user_id {
                effects.push(Effect::Persist(PersistOp::TouchLastSeen {
                    user_id,
                }));
            }
        }
        effects
    }

    // -----------------------------------------------------------------
    // changeMap
    // -----------------------------------------------------------------

    /// Handles a `changeMap` frame. The steps run in a fixed order so no
    /// observer ever sees the player on two maps at once and no old-map
    /// observer misses the departure. A no-op for spectators.
    pub fn change_map(
        &mut self,
        conn: ConnectionId,
        target_map: MapId,
        target_x: f64,
        target_y: f64,
        now: Instant,
    ) -> Vec<Effect> {
        let (old_map, user_id, session_id);
        {
            let Some(session) = self.registry.get(conn) else {
                return Vec::new();
            };
            if session.is_spectator {
                return Vec::new();
            }
            old_map = session.map_id.clone();
            user_id = session.user_id.clone();
            session_id = session.session_id.clone();
        }

        let mut effects = Vec::new();

        // 1. Vacate the old bucket before anyone is told anything.
        self.index.remove_occupant(conn, &old_map);

        // 2. Departure, visible to everyone still on the old map.
        for to in self.index.audience_of(&old_map, None) {
            effects.push(Effect::Send {
                to,
                frame: ServerFrame::PlayerLeft {
                    user_id: user_id.clone(),
                    session_id: session_id.clone(),
                },
            });
        }

        // 3. Land the session on the target map at the spawn point.
        let Some(session) = self.registry.get_mut(conn) else {
            return effects;
        };
        session.map_id = target_map.clone();
        session.position = spawn_position(target_x, target_y);
        session.last_update = now;
        let info = session.info();

        // 4. Occupy the new bucket.
        self.index.add_occupant(conn, &target_map);

        // 5. Arrival, visible to the new map.
        for to in self.index.audience_of(&target_map, Some(conn)) {
            effects.push(Effect::Send {
                to,
                frame: ServerFrame::PlayerJoined {
                    player: info.clone(),
                },
            });
        }

        // 6. Snapshot reply for the mover.
        let players: Vec<PlayerInfo> = self
            .index
            .occupants_of(&target_map)
            .filter(|c| *c != conn)
            .filter_map(|c| self.registry.get(c).map(PlayerSession::info))
            .collect();
        effects.push(Effect::Send {
            to: conn,
            frame: ServerFrame::PlayersList { players },
        });

        tracing::debug!(%conn, from = %old_map, to = %target_map, "map transfer");
        effects
    }

    // -----------------------------------------------------------------
    // leave / transport close
    // -----------------------------------------------------------------

    /// Tears down a connection's presence. Shared by the explicit
    /// `leave` frame, transport close, and the liveness sweep; safe to
    /// call repeatedly for the same connection.
    pub fn leave(&mut self, conn: ConnectionId) -> Vec<Effect> {
        let Some(session) = self.registry.remove(conn) else {
            return Vec::new();
        };

        let mut effects = Vec::new();

        if session.is_spectator {
            self.index.remove_watcher(conn, &session.map_id);
            tracing::info!(%conn, map = %session.map_id, "spectator left");
            return effects;
        }

        self.index.remove_occupant(conn, &session.map_id);

        if let Some(user_id) = &session.user_id {
            effects.push(Effect::Persist(PersistOp::UpsertLastPosition {
                user_id: user_id.clone(),
                map_id: session.map_id.clone(),
                position: session.position.clone(),
            }));
            effects.push(Effect::Persist(PersistOp::DeleteActiveSession {
                user_id: user_id.clone(),
                session_id: session.session_id.clone(),
            }));
        }

        for to in self.index.audience_of(&session.map_id, None) {
            effects.push(Effect::Send {
                to,
                frame: ServerFrame::PlayerLeft {
                    user_id: session.user_id.clone(),
                    session_id: session.session_id.clone(),
                },
            });
        }
        self.push_online_count(&mut effects);

        tracing::info!(
            %conn,
            user_id = session.user_id.as_deref().unwrap_or("-"),
            map = %session.map_id,
            "player left"
        );
        effects
    }

    // -----------------------------------------------------------------
    // saveLocation / heartbeat
    // -----------------------------------------------------------------

    /// Handles a `saveLocation` frame: a direct store write, no
    /// broadcast, independent of movement state.
    pub fn save_location(
        &self,
        conn: ConnectionId,
        position: Position,
        map_id: Option<MapId>,
    ) -> Vec<Effect> {
        let Some(session) = self.registry.get(conn) else {
            return Vec::new();
        };
        if session.is_spectator {
            return Vec::new();
        }
        let Some(user_id) = session.user_id.clone() else {
            return Vec::new();
        };

        vec![Effect::Persist(PersistOp::UpsertLastPosition {
            user_id,
            map_id: map_id.unwrap_or_else(|| session.map_id.clone()),
            position,
        })]
    }

    /// Handles a `heartbeat` frame: refreshes activity and the store's
    /// liveness timestamp. No broadcast, no reply.
    pub fn heartbeat(&mut self, conn: ConnectionId, now: Instant) -> Vec<Effect> {
        let Some(session) = self.registry.get_mut(conn) else {
            return Vec::new();
        };
        session.last_update = now;
        if session.is_spectator {
            return Vec::new();
        }
        match &session.user_id {
            Some(user_id) => vec![Effect::Persist(PersistOp::TouchHeartbeat {
                user_id: user_id.clone(),
                session_id: session.session_id.clone(),
            })],
            None => Vec::new(),
        }
    }

    // -----------------------------------------------------------------
    // liveness sweep
    // -----------------------------------------------------------------

    /// Evicts sessions with no inbound activity past the configured idle
    /// timeout. Returns nothing when the sweep is disabled.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<Effect> {
        let Some(timeout) = self.config.idle_timeout else {
            return Vec::new();
        };

        let stale: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|(_, s)| {
                now.saturating_duration_since(s.last_update) > timeout
            })
            .map(|(conn, _)| conn)
            .collect();

        let mut effects = Vec::new();
        for conn in stale {
            tracing::info!(%conn, "reaping idle session");
            effects.extend(self.leave(conn));
            effects.push(Effect::Close {
                conn,
                reason: CloseReason::IdleTimeout,
            });
        }
        effects
    }

    // -----------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------

    /// Queues the global non-spectator count to every live connection,
    /// spectators included.
    fn push_online_count(&self, effects: &mut Vec<Effect>) {
        let count = self.registry.online_count();
        for to in self.registry.connections() {
            effects.push(Effect::Send {
                to,
                frame: ServerFrame::OnlineCount { count },
            });
        }
    }

    /// Server milliseconds for client-side interpolation.
    fn timestamp_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

// =========================================================================
// Tests
// =========================================================================
