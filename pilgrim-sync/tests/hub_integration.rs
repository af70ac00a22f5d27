//! Integration tests for the group hub.
//!
//! These tests start a real hub on a free port and talk to it with raw
//! WebSocket clients carrying session cookies.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use pilgrim_sync::protocol::{
    Beacon, ClientMessage, Location, Presence, ServerMessage, SitrepKind,
};
use pilgrim_sync::server::{HubConfig, HubServer};
use pilgrim_sync::store::{Collaborators, CookieSessions, MemoryStore, Waypoint};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const GROUP: i64 = 7;

struct TestHub {
    port: u16,
    store: Arc<MemoryStore>,
    hub: HubServer,
}

/// Start a hub on a free port with users 1..=3 in group 7 and user 4 elsewhere.
async fn start_test_hub() -> TestHub {
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(CookieSessions::default());
    for user in 1..=3 {
        store.add_member(user, GROUP).await;
        sessions.insert(format!("tok-{user}"), user);
    }
    store.add_member(4, 99).await;
    sessions.insert("tok-4", 4);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = HubServer::new(
        HubConfig { broadcast_capacity: 64, ..HubConfig::default() },
        Collaborators::in_memory(store.clone(), sessions),
    );
    let serving = hub.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    TestHub { port, store, hub }
}

async fn connect(port: u16, path: &str, token: Option<&str>) -> Result<Ws, WsError> {
    let mut request = format!("ws://127.0.0.1:{port}{path}").into_client_request().unwrap();
    if let Some(token) = token {
        let cookie = HeaderValue::from_str(&format!("pilgrim.sid={token}")).unwrap();
        request.headers_mut().insert(COOKIE, cookie);
    }
    tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
}

async fn send(ws: &mut Ws, message: ClientMessage) {
    ws.send(Message::text(message.encode().unwrap())).await.unwrap();
}

async fn ws_text(ws: &mut Ws, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

async fn join(port: u16, user: i64) -> Ws {
    let mut ws = connect(port, "/ws", Some(&format!("tok-{user}"))).await.unwrap();
    send(&mut ws, ClientMessage::JoinGroup { user_id: Some(user), group_id: GROUP }).await;
    ws
}

/// Next server message, or `None` on timeout or close.
async fn recv(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(ServerMessage::decode(text.as_str()).unwrap())
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => return None,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Skip messages until one matches.
async fn recv_until(ws: &mut Ws, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let msg = recv(ws).await.expect("expected a matching message");
        if pred(&msg) {
            return msg;
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let got = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(got.is_err(), "expected no message, got {got:?}");
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(resp) => resp.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upgrade_without_session_rejected() {
    let hub = start_test_hub().await;

    let err = connect(hub.port, "/ws", None).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    let err = connect(hub.port, "/ws", Some("forged")).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.hub.stats().await.rejected_handshakes, 2);
}

#[tokio::test]
async fn test_upgrade_on_wrong_path_rejected() {
    let hub = start_test_hub().await;
    let err = connect(hub.port, "/socket", Some("tok-1")).await.unwrap_err();
    assert_eq!(http_status(err), 404);
}

#[tokio::test]
async fn test_join_announces_member() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    // Let the first join land before the second.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob = join(hub.port, 2).await;

    let msg = recv(&mut alice).await.unwrap();
    assert_eq!(msg, ServerMessage::MemberUpdate { user_id: 2, status: Presence::Online });

    // Bob is told who was already here, not about himself.
    let msg = recv(&mut bob).await.unwrap();
    assert_eq!(msg, ServerMessage::MemberUpdate { user_id: 1, status: Presence::Online });
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_location_excludes_sender() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob = join(hub.port, 2).await;
    recv(&mut alice).await.unwrap();
    recv(&mut bob).await.unwrap();

    let location = Location::new(34.9671, 135.7727, 1_700_000_000_000);
    send(&mut bob, ClientMessage::LocationUpdate { location }).await;

    let msg = recv(&mut alice).await.unwrap();
    assert_eq!(msg, ServerMessage::LocationUpdate { user_id: 2, location });
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_beacon_reaches_everyone_with_audit() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob = join(hub.port, 2).await;
    recv(&mut alice).await.unwrap();
    recv(&mut bob).await.unwrap();

    send(&mut bob, ClientMessage::BeaconSignal { signal: Beacon::Sos }).await;

    for ws in [&mut alice, &mut bob] {
        let msg = recv(ws).await.unwrap();
        assert_eq!(msg, ServerMessage::BeaconSignal { user_id: 2, signal: Beacon::Sos });
        match recv(ws).await.unwrap() {
            ServerMessage::Sitrep { sitrep } => {
                assert_eq!(sitrep.content, "Beacon Signal: SOS");
                assert_eq!(sitrep.kind, SitrepKind::Warning);
            }
            other => panic!("expected sitrep, got {other:?}"),
        }
    }

    let member = hub.store.member(2).await.unwrap();
    assert_eq!(member.status, pilgrim_sync::MemberStatus::Sos);
}

#[tokio::test]
async fn test_sitrep_and_status_broadcast_to_all() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(&mut alice, ClientMessage::Sitrep { text: "Water stop at the gate".into() }).await;
    match recv(&mut alice).await.unwrap() {
        ServerMessage::Sitrep { sitrep } => {
            assert_eq!(sitrep.content, "Water stop at the gate");
            assert_eq!(sitrep.kind, SitrepKind::Info);
            assert_eq!(sitrep.user_id, 1);
        }
        other => panic!("expected sitrep, got {other:?}"),
    }

    send(&mut alice, ClientMessage::StatusUpdate { status: "resting".into() }).await;
    let msg = recv(&mut alice).await.unwrap();
    assert_eq!(msg, ServerMessage::StatusUpdate { user_id: 1, status: "resting".into() });
    assert_eq!(hub.store.sitreps(GROUP).await.len(), 1);
}

#[tokio::test]
async fn test_non_member_join_closes_socket() {
    let hub = start_test_hub().await;
    let mut mallory = connect(hub.port, "/ws", Some("tok-4")).await.unwrap();
    send(&mut mallory, ClientMessage::JoinGroup { user_id: Some(4), group_id: GROUP }).await;

    assert!(recv(&mut mallory).await.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.hub.registry().connection_count(GROUP).await, 0);
}

#[tokio::test]
async fn test_claimed_user_id_is_ignored() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // User 4 claims to be user 2; the session decides.
    let mut mallory = connect(hub.port, "/ws", Some("tok-4")).await.unwrap();
    send(&mut mallory, ClientMessage::JoinGroup { user_id: Some(2), group_id: GROUP }).await;
    assert!(recv(&mut mallory).await.is_none());
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_messages_before_join_ignored() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = connect(hub.port, "/ws", Some("tok-2")).await.unwrap();
    send(&mut bob, ClientMessage::BeaconSignal { signal: Beacon::Regroup }).await;
    ws_text(&mut bob, "not json").await;

    assert_silent(&mut alice).await;
    assert!(hub.store.sitreps(GROUP).await.is_empty());
}

#[tokio::test]
async fn test_disconnect_announces_offline() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob = join(hub.port, 2).await;
    recv(&mut alice).await.unwrap();

    bob.close(None).await.unwrap();

    let msg = recv(&mut alice).await.unwrap();
    assert_eq!(msg, ServerMessage::MemberUpdate { user_id: 2, status: Presence::Offline });
}

#[tokio::test]
async fn test_second_tab_keeps_member_online() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob_tab1 = join(hub.port, 2).await;
    recv(&mut alice).await.unwrap();
    let _bob_tab2 = join(hub.port, 2).await;
    recv(&mut alice).await.unwrap();

    bob_tab1.close(None).await.unwrap();
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_last_member_leaving_removes_group() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.hub.stats().await.active_groups, 1);

    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.hub.stats().await.active_groups, 0);
}

#[tokio::test]
async fn test_rejoin_replays_last_known_locations() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let location = Location::new(35.0, 135.0, 1_700_000_000_000);
    send(&mut alice, ClientMessage::LocationUpdate { location }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = join(hub.port, 2).await;
    let msg = recv_until(&mut bob, |m| matches!(m, ServerMessage::LocationUpdate { .. })).await;
    assert_eq!(msg, ServerMessage::LocationUpdate { user_id: 1, location });
}

#[tokio::test]
async fn test_waypoint_arrival_sitrep() {
    let hub = start_test_hub().await;
    hub.store
        .set_waypoints(
            GROUP,
            vec![Waypoint {
                id: 11,
                group_id: GROUP,
                name: "Torii Gate".into(),
                latitude: 34.9671,
                longitude: 135.7727,
                radius: 50.0,
                kind: "landmark".into(),
            }],
        )
        .await;

    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let location = Location::new(34.9672, 135.7727, 1_700_000_000_000);
    send(&mut alice, ClientMessage::LocationUpdate { location }).await;

    match recv(&mut alice).await.unwrap() {
        ServerMessage::Sitrep { sitrep } => {
            assert_eq!(sitrep.content, "ARRIVED at Torii Gate");
            assert_eq!(sitrep.kind, SitrepKind::Status);
        }
        other => panic!("expected arrival sitrep, got {other:?}"),
    }
    assert_eq!(hub.store.member(1).await.unwrap().last_waypoint, Some(11));
}

#[tokio::test]
async fn test_departed_member_not_replayed() {
    let hub = start_test_hub().await;
    let mut alice = join(hub.port, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&mut alice, ClientMessage::LocationUpdate { location: Location::new(35.0, 135.0, 1) }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.hub.geofence().last_known(GROUP).await.len(), 1);

    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.hub.geofence().last_known(GROUP).await.is_empty());

    let mut bob = join(hub.port, 2).await;
    assert_silent(&mut bob).await;
}
