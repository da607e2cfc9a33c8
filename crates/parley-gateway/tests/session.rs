//! Drives the `/ws` endpoint: the upgrade gate in-process, and whole
//! sessions over a real socket.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;
use uuid::Uuid;

use parley_db::{Database, RoomStore};
use parley_gateway::GatewayState;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::handshake::{DEFAULT_HANDSHAKE_TIMEOUT, SessionAuthenticator};
use parley_gateway::ingest::MessageIngestor;
use parley_gateway::presence::{PresenceMode, PresenceRegistry};
use parley_gateway::upgrade;
use parley_types::api::Claims;
use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::Identity;
use parley_types::policy::HierarchyPolicy;

const SECRET: &str = "gateway-session-test-secret";
const ALICE: &str = "alice@example.com";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn gateway() -> GatewayState {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.create_user("u1", "Alice", ALICE, "hash").unwrap();

    let rooms = Arc::new(RoomStore::new(db.clone(), Arc::new(HierarchyPolicy)));
    rooms.create_room("r1", &Identity::from(ALICE)).unwrap();
    rooms.create_room("r2", &Identity::from(ALICE)).unwrap();

    let dispatcher = Dispatcher::new();
    let presence = PresenceRegistry::new(dispatcher.clone(), PresenceMode::Counted);

    GatewayState {
        authenticator: SessionAuthenticator::new(SECRET, db, DEFAULT_HANDSHAKE_TIMEOUT),
        dispatcher: dispatcher.clone(),
        presence,
        ingestor: MessageIngestor::new(rooms, dispatcher),
    }
}

fn token(sub: &str, exp_offset_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_string(),
        user_id: Uuid::new_v4(),
        iat: now as usize,
        exp: (now + exp_offset_secs) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn upgrade_status(state: GatewayState, uri: &str) -> StatusCode {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    upgrade::router(state).oneshot(request).await.unwrap().status()
}

async fn serve(state: GatewayState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upgrade::router(state)).await.unwrap();
    });
    format!("ws://{}/ws", addr)
}

async fn next_event(client: &mut Client) -> GatewayEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_command(client: &mut Client, command: &GatewayCommand) {
    let text = serde_json::to_string(command).unwrap();
    client.send(WsMessage::text(text)).await.unwrap();
}

async fn wait_until_offline(presence: &PresenceRegistry, identity: &Identity) {
    for _ in 0..100 {
        if !presence.contains(identity) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} still present", identity);
}

#[tokio::test]
async fn expired_token_is_refused_before_upgrade() {
    let state = gateway();
    let presence = state.presence.clone();

    let uri = format!("/ws?token={}", token(ALICE, -3600));
    assert_eq!(upgrade_status(state, &uri).await, StatusCode::UNAUTHORIZED);
    assert!(presence.snapshot().is_empty());
}

#[tokio::test]
async fn missing_token_is_refused() {
    let state = gateway();
    let presence = state.presence.clone();

    assert_eq!(upgrade_status(state, "/ws").await, StatusCode::UNAUTHORIZED);
    assert!(presence.snapshot().is_empty());
}

#[tokio::test]
async fn valid_token_without_upgrade_headers_is_not_a_session() {
    let state = gateway();
    let presence = state.presence.clone();

    let uri = format!("/ws?token={}", token(ALICE, 3600));
    let status = upgrade_status(state, &uri).await;
    assert!(status.is_client_error());
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert!(presence.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_lifecycle() {
    let state = gateway();
    let presence = state.presence.clone();
    let url = serve(state).await;
    let alice = Identity::from(ALICE);

    let (mut client, _) = connect_async(format!("{}?token={}", url, token(ALICE, 3600)))
        .await
        .unwrap();

    match next_event(&mut client).await {
        GatewayEvent::Ready { identity, .. } => assert_eq!(identity, alice),
        other => panic!("expected Ready, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut client).await,
        GatewayEvent::PresenceUpdate {
            users: vec![alice.clone()]
        }
    );
    assert!(presence.contains(&alice));

    send_command(
        &mut client,
        &GatewayCommand::Subscribe {
            room_ids: vec!["r1".into()],
        },
    )
    .await;
    for (room_id, content) in [("r2", "not for you"), ("r1", "hello")] {
        send_command(
            &mut client,
            &GatewayCommand::SendMessage {
                room_id: room_id.into(),
                sender: None,
                content: content.into(),
            },
        )
        .await;
    }

    match next_event(&mut client).await {
        GatewayEvent::MessageCreate { room_id, message } => {
            assert_eq!(room_id, "r1");
            assert_eq!(message.content, "hello");
            assert_eq!(message.sender, alice);
        }
        other => panic!("expected MessageCreate, got {:?}", other),
    }

    client.close(None).await.unwrap();
    wait_until_offline(&presence, &alice).await;
}
