//! Per-connection handler: frame routing and effect execution.
//!
//! Each accepted connection gets its own Tokio task running this
//! handler. The flow per frame is:
//!   1. Receive and decode a [`ClientFrame`] (bad frames earn an
//!      `error` reply, never a disconnect)
//!   2. Any gateway reads the frame needs happen *before* the engine
//!      lock is taken
//!   3. One locked, synchronous engine call mutates presence state and
//!      returns effects
//!   4. Effects are executed outside the lock: queued sends, transport
//!      closes, fire-and-forget store writes

use std::sync::Arc;
use std::time::Instant;

use overmap_presence::{
    ActiveSession, Effect, GatewayError, JoinRequest, PersistOp,
    PersistenceGateway,
};
use overmap_protocol::{ClientFrame, Codec, ServerFrame};
use overmap_transport::{Connection, WebSocketConnection};

use crate::OvermapError;
use crate::server::ServerState;

/// Display name used when neither the store nor the client supplies one.
const FALLBACK_USERNAME: &str = "anonymous";

/// Handles a single connection from accept to close.
///
/// Teardown is unconditional: whether the loop ends with a clean close,
/// a `leave` frame, or a transport error, the connection's presence is
/// torn down exactly once ([`PresenceEngine::leave`] is idempotent, so a
/// takeover eviction racing this teardown is harmless).
///
/// [`PresenceEngine::leave`]: overmap_presence::PresenceEngine::leave
pub(crate) async fn handle_connection<G, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<G, C>>,
) -> Result<(), OvermapError>
where
    G: PersistenceGateway,
    C: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    {
        let mut shared = state.shared.lock().await;
        shared.peers.insert(conn_id, conn.clone());
    }

    let result = connection_loop(&conn, &state).await;

    let effects = {
        let mut shared = state.shared.lock().await;
        shared.peers.remove(&conn_id);
        shared.engine.leave(conn_id)
    };
    dispatch_effects(&state, effects).await;

    result
}

/// Receives and routes frames until the connection ends.
async fn connection_loop<G, C>(
    conn: &WebSocketConnection,
    state: &Arc<ServerState<G, C>>,
) -> Result<(), OvermapError>
where
    G: PersistenceGateway,
    C: Codec,
{
    let conn_id = conn.id();

    loop {
        let data = match conn.recv().await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::debug!(%conn_id, "connection closed");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                return Ok(());
            }
        };

        let frame: ClientFrame = match state.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "unparsable frame");
                send_frame(
                    conn,
                    &state.codec,
                    &ServerFrame::Error {
                        message: "unparsable frame".to_string(),
                    },
                )
                .await?;
                continue;
            }
        };

        if dispatch_frame(conn, state, frame).await {
            let _ = conn.close().await;
            return Ok(());
        }
    }
}

/// Routes one decoded frame. Returns `true` when the connection should
/// close.
async fn dispatch_frame<G, C>(
    conn: &WebSocketConnection,
    state: &Arc<ServerState<G, C>>,
    frame: ClientFrame,
) -> bool
where
    G: PersistenceGateway,
    C: Codec,
{
    let conn_id = conn.id();

    let effects = match frame {
        ClientFrame::Join {
            user_id,
            session_id,
            position,
            username,
            sprite,
            map_id,
            is_spectator,
            device,
        } => {
            let (username, prior) =
                prepare_join(state, user_id.as_deref(), username, is_spectator)
                    .await;
            let req = JoinRequest {
                user_id,
                session_id,
                username,
                sprite: sprite.unwrap_or_else(|| "default".to_string()),
                map_id: map_id
                    .unwrap_or_else(|| state.config.default_map.clone()),
                position,
                is_spectator,
                device,
            };
            let mut shared = state.shared.lock().await;
            shared.engine.join(conn_id, req, prior, Instant::now())
        }

        ClientFrame::UpdatePosition { position } => {
            let mut shared = state.shared.lock().await;
            shared.engine.update_position(conn_id, position, Instant::now())
        }

        ClientFrame::ChangeMap {
            target_map_id,
            target_x,
            target_y,
        } => {
            let mut shared = state.shared.lock().await;
            shared.engine.change_map(
                conn_id,
                target_map_id,
                target_x,
                target_y,
                Instant::now(),
            )
        }

        ClientFrame::SaveLocation { position, map_id } => {
            let shared = state.shared.lock().await;
            shared.engine.save_location(conn_id, position, map_id)
        }

        ClientFrame::Heartbeat => {
            let mut shared = state.shared.lock().await;
            shared.engine.heartbeat(conn_id, Instant::now())
        }

        // Same teardown as a dropped transport, run by the caller.
        ClientFrame::Leave => return true,
    };

    dispatch_effects(state, effects).await;
    false
}

/// Resolves the display name and reads the prior active-session record.
///
/// Both are gateway round-trips, done before the engine lock is taken.
/// Failures degrade: an unreachable store means "no prior session" and
/// the client-supplied name.
async fn prepare_join<G, C>(
    state: &Arc<ServerState<G, C>>,
    user_id: Option<&str>,
    client_name: Option<String>,
    is_spectator: bool,
) -> (String, Option<ActiveSession>)
where
    G: PersistenceGateway,
    C: Codec,
{
    let fallback =
        || client_name.clone().unwrap_or_else(|| FALLBACK_USERNAME.to_string());

    let Some(user_id) = user_id else {
        return (fallback(), None);
    };

    // Spectators never participate in takeover, so skip the read.
    let prior = if is_spectator {
        None
    } else {
        match state.gateway.get_active_session(user_id).await {
            Ok(prior) => prior,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = %e,
                    "active-session read failed, treating as none"
                );
                None
            }
        }
    };

    if let Some(name) = state.profiles.lock().await.get(user_id) {
        return (name.to_string(), prior);
    }

    let username = match state.gateway.lookup_profile(user_id).await {
        Ok(Some(name)) => {
            state.profiles.lock().await.insert(user_id, &name);
            name
        }
        Ok(None) => fallback(),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "profile lookup failed");
            fallback()
        }
    };

    (username, prior)
}

// ---------------------------------------------------------------------------
// Effect execution
// ---------------------------------------------------------------------------

/// Executes a batch of engine effects, in order.
///
/// The peer table is snapshotted under the lock, then all IO runs
/// lock-free. A send to a connection that vanished in between is
/// dropped; closes and store writes for it are equally harmless.
pub(crate) async fn dispatch_effects<G, C>(
    state: &Arc<ServerState<G, C>>,
    effects: Vec<Effect>,
) where
    G: PersistenceGateway,
    C: Codec,
{
    let peers: std::collections::HashMap<_, _> = {
        let shared = state.shared.lock().await;
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send { to, .. } => Some(*to),
                Effect::Close { conn, .. } => Some(*conn),
                Effect::Persist(_) => None,
            })
            .filter_map(|id| {
                shared.peers.get(&id).map(|conn| (id, conn.clone()))
            })
            .collect()
    };

    for effect in effects {
        match effect {
            Effect::Send { to, frame } => {
                let Some(peer) = peers.get(&to) else {
                    continue;
                };
                send_or_log(peer, &state.codec, &frame).await;
            }

            Effect::Close { conn: id, reason } => {
                let Some(peer) = peers.get(&id) else {
                    continue;
                };
                if let Err(e) =
                    peer.close_with(reason.code(), reason.as_str()).await
                {
                    tracing::debug!(conn = %id, error = %e, "close failed");
                }
            }

            Effect::Persist(op) => spawn_persist(state, op),
        }
    }
}

/// Encodes and queues one frame, logging instead of failing the batch.
async fn send_or_log<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
    frame: &ServerFrame,
) {
    let bytes = match codec.encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "frame encode failed");
            return;
        }
    };
    if let Err(e) = conn.send(&bytes).await {
        tracing::debug!(conn = %conn.id(), error = %e, "send failed");
    }
}

/// Sends one frame, propagating transport errors to the caller.
async fn send_frame<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
    frame: &ServerFrame,
) -> Result<(), OvermapError> {
    let bytes = codec.encode(frame)?;
    conn.send(&bytes).await.map_err(OvermapError::Transport)
}

/// Spawns a best-effort store write. Failures are logged, never
/// retried, and never surface to the protocol.
fn spawn_persist<G, C>(state: &Arc<ServerState<G, C>>, op: PersistOp)
where
    G: PersistenceGateway,
    C: Codec,
{
    let gateway = Arc::clone(&state.gateway);
    tokio::spawn(async move {
        if let Err(e) = run_persist(gateway.as_ref(), &op).await {
            tracing::warn!(error = %e, ?op, "store write failed");
        }
    });
}

async fn run_persist<G: PersistenceGateway>(
    gateway: &G,
    op: &PersistOp,
) -> Result<(), GatewayError> {
    match op {
        PersistOp::UpsertLastPosition {
            user_id,
            map_id,
            position,
        } => gateway.upsert_last_position(user_id, map_id, position).await,

        PersistOp::UpsertActiveSession {
            user_id,
            session_id,
            device_info,
            connected_at,
        } => {
            gateway
                .upsert_active_session(
                    user_id,
                    session_id,
                    device_info.as_deref(),
                    *connected_at,
                )
                .await
        }

        PersistOp::DeleteActiveSession {
            user_id,
            session_id,
        } => gateway.delete_active_session(user_id, session_id).await,

        PersistOp::TouchHeartbeat {
            user_id,
            session_id,
        } => gateway.touch_heartbeat(user_id, session_id).await,

        PersistOp::TouchLastSeen { user_id } => {
            gateway.touch_last_seen(user_id).await
        }
    }
}
