//! Integration tests for the Overmap server: full connection flow over
//! a real WebSocket, speaking the client's JSON dialect directly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use overmap::prelude::*;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Starts a server on a random port and returns its address.
async fn start_server(
    config: PresenceConfig,
    gateway: Arc<MemoryGateway>,
) -> String {
    let server = OvermapServerBuilder::new()
        .bind("127.0.0.1:0")
        .presence_config(config)
        .build(gateway)
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

/// Config with no rate limiting, so tests can move freely.
fn open_config() -> PresenceConfig {
    PresenceConfig {
        update_interval: Duration::ZERO,
        ..PresenceConfig::default()
    }
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send_json(ws: &mut ClientWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Receives frames, skipping any whose `type` doesn't match, until the
/// wanted frame arrives or two seconds pass.
async fn recv_until(ws: &mut ClientWs, frame_type: &str) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {frame_type}"))
            .expect("stream ended")
            .expect("recv");
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).expect("valid json");
            if value["type"] == frame_type {
                return value;
            }
        }
    }
}

/// Receives until the server closes the socket; returns the close code
/// and reason.
async fn recv_close(ws: &mut ClientWs) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("recv");
        if let Message::Close(Some(frame)) = msg {
            return (frame.code.into(), frame.reason.to_string());
        }
    }
}

/// Asserts no frame arrives for the given duration.
async fn assert_silent(ws: &mut ClientWs, for_ms: u64) {
    let res =
        tokio::time::timeout(Duration::from_millis(for_ms), ws.next()).await;
    assert!(res.is_err(), "expected silence, got {res:?}");
}

/// Joins and waits for the `playersList` reply.
async fn join(
    ws: &mut ClientWs,
    user_id: &str,
    session_id: &str,
    map_id: &str,
) -> Value {
    send_json(
        ws,
        json!({
            "type": "join",
            "userId": user_id,
            "sessionId": session_id,
            "username": user_id,
            "sprite": "default",
            "mapId": map_id,
            "position": { "x": 0, "y": 0 },
        }),
    )
    .await;
    recv_until(ws, "playersList").await
}

// =========================================================================
// Join
// =========================================================================

#[tokio::test]
async fn test_join_replies_with_players_list_then_online_count() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws = connect(&addr).await;

    let list = join(&mut ws, "u1", "s1", "town").await;
    assert_eq!(list["players"], json!([]));

    let count = recv_until(&mut ws, "onlineCount").await;
    assert_eq!(count["count"], 1);
}

#[tokio::test]
async fn test_second_join_notifies_first_and_sees_snapshot() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;

    join(&mut ws1, "u1", "s1", "town").await;

    let list = join(&mut ws2, "u2", "s2", "town").await;
    assert_eq!(list["players"][0]["userId"], "u1");

    let joined = recv_until(&mut ws1, "playerJoined").await;
    assert_eq!(joined["player"]["userId"], "u2");
    let count = recv_until(&mut ws1, "onlineCount").await;
    assert_eq!(count["count"], 2);
}

#[tokio::test]
async fn test_join_resolves_username_from_profile() {
    let gateway = Arc::new(MemoryGateway::new().with_profile("u1", "Ada"));
    let addr = start_server(open_config(), Arc::clone(&gateway)).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;

    // The client-supplied name loses to the stored profile.
    join(&mut ws1, "u1", "s1", "town").await;

    let list = join(&mut ws2, "u2", "s2", "town").await;
    assert_eq!(list["players"][0]["username"], "Ada");
}

// =========================================================================
// Session takeover
// =========================================================================

#[tokio::test]
async fn test_duplicate_connection_closed_with_4001() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;

    // Same user, same session id: a duplicate client instance.
    let mut ws2 = connect(&addr).await;
    join(&mut ws2, "u1", "s1", "town").await;

    let (code, reason) = recv_close(&mut ws1).await;
    assert_eq!(code, 4001);
    assert_eq!(reason, "duplicate-connection");
}

#[tokio::test]
async fn test_session_replaced_gets_kick_notice_then_4002() {
    let gateway = Arc::new(MemoryGateway::new());
    let addr = start_server(open_config(), Arc::clone(&gateway)).await;

    let mut ws1 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    // Let the fire-and-forget active-session upsert land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same user, new session id: the newest login wins.
    let mut ws2 = connect(&addr).await;
    join(&mut ws2, "u1", "s2", "town").await;

    let kicked = recv_until(&mut ws1, "sessionKicked").await;
    assert!(kicked["message"].as_str().is_some());
    let (code, reason) = recv_close(&mut ws1).await;
    assert_eq!(code, 4002);
    assert_eq!(reason, "session-replaced");

    // The store now records the winning session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let active = gateway.active_session_of("u1").expect("record should exist");
    assert_eq!(active.session_id, "s2");
}

// =========================================================================
// Movement
// =========================================================================

#[tokio::test]
async fn test_update_position_relayed_to_same_map() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;

    send_json(
        &mut ws1,
        json!({
            "type": "updatePosition",
            "position": { "x": 5, "y": 6, "direction": "left" },
        }),
    )
    .await;

    let moved = recv_until(&mut ws2, "playerMoved").await;
    assert_eq!(moved["userId"], "u1");
    assert_eq!(moved["position"]["x"], 5);
    assert!(moved["timestamp"].is_u64());
}

#[tokio::test]
async fn test_update_position_not_relayed_across_maps() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "dungeon").await;
    // Drain ws2's own onlineCount so the silence check starts clean.
    recv_until(&mut ws2, "onlineCount").await;

    send_json(
        &mut ws1,
        json!({ "type": "updatePosition", "position": { "x": 1 } }),
    )
    .await;

    assert_silent(&mut ws2, 300).await;
}

#[tokio::test]
async fn test_update_position_rate_limited() {
    // One accepted update per minute: the second must be dropped.
    let config = PresenceConfig {
        update_interval: Duration::from_secs(60),
        ..PresenceConfig::default()
    };
    let addr = start_server(config, Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;

    send_json(
        &mut ws1,
        json!({ "type": "updatePosition", "position": { "x": 1 } }),
    )
    .await;
    send_json(
        &mut ws1,
        json!({ "type": "updatePosition", "position": { "x": 2 } }),
    )
    .await;

    let moved = recv_until(&mut ws2, "playerMoved").await;
    assert_eq!(moved["position"]["x"], 1);
    assert_silent(&mut ws2, 300).await;
}

// =========================================================================
// Map transfer
// =========================================================================

#[tokio::test]
async fn test_change_map_notifies_both_maps_and_replies_with_snapshot() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    let mut ws3 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;
    join(&mut ws3, "u3", "s3", "dungeon").await;

    send_json(
        &mut ws1,
        json!({
            "type": "changeMap",
            "targetMapId": "dungeon",
            "targetX": 3.0,
            "targetY": 4.0,
        }),
    )
    .await;

    // The old map sees the departure.
    let left = recv_until(&mut ws2, "playerLeft").await;
    assert_eq!(left["userId"], "u1");

    // The new map sees the arrival, at the spawn point.
    let joined = recv_until(&mut ws3, "playerJoined").await;
    assert_eq!(joined["player"]["userId"], "u1");
    assert_eq!(joined["player"]["position"]["x"], 3.0);
    assert_eq!(joined["player"]["position"]["direction"], "down");

    // The mover gets the new map's occupants.
    let list = recv_until(&mut ws1, "playersList").await;
    assert_eq!(list["players"][0]["userId"], "u3");
}

// =========================================================================
// Leave and disconnect
// =========================================================================

#[tokio::test]
async fn test_leave_broadcasts_departure_and_persists() {
    let gateway = Arc::new(MemoryGateway::new());
    let addr = start_server(open_config(), Arc::clone(&gateway)).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;

    send_json(&mut ws1, json!({ "type": "leave" })).await;

    let left = recv_until(&mut ws2, "playerLeft").await;
    assert_eq!(left["userId"], "u1");
    let count = recv_until(&mut ws2, "onlineCount").await;
    assert_eq!(count["count"], 1);

    // The final position lands in the store and the active-session
    // record is cleared.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (map, _pos) = gateway.last_position_of("u1").expect("stored");
    assert_eq!(map, MapId::from("town"));
    assert!(gateway.active_session_of("u1").is_none());
}

#[tokio::test]
async fn test_dropped_transport_torn_down_like_leave() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;

    drop(ws1);

    let left = recv_until(&mut ws2, "playerLeft").await;
    assert_eq!(left["userId"], "u1");
}

// =========================================================================
// Malformed frames
// =========================================================================

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut ws1 = connect(&addr).await;
    let mut ws2 = connect(&addr).await;
    join(&mut ws1, "u1", "s1", "town").await;
    join(&mut ws2, "u2", "s2", "town").await;

    ws1.send(Message::Text("not json".into())).await.expect("send");
    let err = recv_until(&mut ws1, "error").await;
    assert_eq!(err["message"], "unparsable frame");

    // Unknown frame types earn the same reply.
    ws1.send(Message::Text(r#"{"type":"fly"}"#.into()))
        .await
        .expect("send");
    recv_until(&mut ws1, "error").await;

    // The connection is still in the map: movement still relays.
    send_json(
        &mut ws1,
        json!({ "type": "updatePosition", "position": { "x": 9 } }),
    )
    .await;
    let moved = recv_until(&mut ws2, "playerMoved").await;
    assert_eq!(moved["position"]["x"], 9);
}

// =========================================================================
// Spectators
// =========================================================================

#[tokio::test]
async fn test_spectator_observes_without_being_seen() {
    let addr = start_server(open_config(), Arc::new(MemoryGateway::new())).await;
    let mut player = connect(&addr).await;
    let mut spectator = connect(&addr).await;
    join(&mut player, "u1", "s1", "town").await;
    // Drain the player's own onlineCount so the silence check is clean.
    recv_until(&mut player, "onlineCount").await;

    send_json(
        &mut spectator,
        json!({
            "type": "join",
            "sessionId": "spec-1",
            "mapId": "town",
            "position": { "x": 0, "y": 0 },
            "isSpectator": true,
        }),
    )
    .await;

    // The spectator sees the snapshot but changes nothing for players.
    let list = recv_until(&mut spectator, "playersList").await;
    assert_eq!(list["players"][0]["userId"], "u1");
    assert_silent(&mut player, 300).await;

    // It still observes movement on its map.
    send_json(
        &mut player,
        json!({ "type": "updatePosition", "position": { "x": 4 } }),
    )
    .await;
    let moved = recv_until(&mut spectator, "playerMoved").await;
    assert_eq!(moved["userId"], "u1");

    // A later real join is counted; the spectator is not.
    let mut ws3 = connect(&addr).await;
    join(&mut ws3, "u3", "s3", "town").await;
    let count = recv_until(&mut spectator, "onlineCount").await;
    assert_eq!(count["count"], 2);
}
